// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Pluggable hardware functionality.
//!
//! This module provides traits for plugging in the device-specific pieces the
//! rest of the crate depends on. Currently, that is only raw NVM access.

pub mod flash;
