// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Test data of all kinds; currently, hand-encoded update envelopes.

pub mod suit;
