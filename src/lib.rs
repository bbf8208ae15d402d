// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! `firmstore` is the on-device storage and delivery engine for a
//! firmware-update manifest framework.
//!
//! It owns three responsibilities:
//! - durable storage of signed update manifests ("envelopes") and of the
//!   pending update candidate, in raw non-volatile memory; see [`storage`].
//! - a content cache of auxiliary payloads addressed by URI and packed into
//!   dedicated NVM partitions; see [`cache`].
//! - a pluggable, flow-controlled protocol for streaming a payload that is
//!   missing locally from some other source into a destination [`sink`]; see
//!   [`fetch`] and, with the `std` feature, [`ipc`].
//!
//! All of the storage layers talk to NVM exclusively through the
//! [`hardware::flash::Flash`] trait, and all byte-producing operations write
//! through the [`sink::Sink`] trait.
//!
//! None of the contexts in this crate are global: every subsystem is an
//! explicit value owned by the integration and passed by reference.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

#[macro_use]
mod debug;

#[macro_use]
pub mod cbor;

pub mod cache;
pub mod fetch;
pub mod hardware;
pub mod io;
pub mod sink;
pub mod storage;

#[cfg(feature = "std")]
pub mod ipc;

#[cfg(all(feature = "std", not(test)))]
extern crate std;
