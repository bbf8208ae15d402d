// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Hand-encoded update envelopes.
//!
//! These are built at test time rather than checked in, since most tests
//! want to vary the class ID or the payload sizes. The encoding is always
//! minimal, like a real envelope generator would produce.

/// The first element of a manifest component ID.
pub const COMPONENT_ID_TYPE: &str = "INSTLD_MFST";

fn head(out: &mut Vec<u8>, major: u8, arg: u64) {
    let ty = major << 5;
    if arg < 24 {
        out.push(ty | arg as u8);
    } else if arg <= 0xff {
        out.push(ty | 24);
        out.push(arg as u8);
    } else if arg <= 0xffff {
        out.push(ty | 25);
        out.extend_from_slice(&(arg as u16).to_be_bytes());
    } else if arg <= 0xffff_ffff {
        out.push(ty | 26);
        out.extend_from_slice(&(arg as u32).to_be_bytes());
    } else {
        out.push(ty | 27);
        out.extend_from_slice(&arg.to_be_bytes());
    }
}

fn uint(out: &mut Vec<u8>, n: u64) {
    head(out, 0, n);
}

fn bstr(out: &mut Vec<u8>, bytes: &[u8]) {
    head(out, 2, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

fn tstr(out: &mut Vec<u8>, text: &str) {
    head(out, 3, text.len() as u64);
    out.extend_from_slice(text.as_bytes());
}

/// Returns an authentication wrapper carrying `signature`.
///
/// The store never looks inside it, so this is just `[bstr(signature)]`.
pub fn auth(signature: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    head(&mut out, 4, 1);
    bstr(&mut out, signature);
    out
}

/// Returns a manifest for `class_id`, with `padding` bytes of opaque
/// common data ahead of the component ID.
pub fn manifest(class_id: &[u8; 16], padding: usize) -> Vec<u8> {
    let mut out = Vec::new();
    head(&mut out, 5, 5);

    // Version and sequence number.
    uint(&mut out, 1);
    uint(&mut out, 1);
    uint(&mut out, 2);
    uint(&mut out, 7);

    // Common data.
    uint(&mut out, 3);
    bstr(&mut out, &vec![0xc0; padding]);

    // Reference URI, as a nested structure.
    uint(&mut out, 4);
    head(&mut out, 4, 2);
    uint(&mut out, 300);
    tstr(&mut out, "#image");

    // Component ID.
    uint(&mut out, 5);
    head(&mut out, 4, 2);
    let mut kind = Vec::new();
    tstr(&mut kind, COMPONENT_ID_TYPE);
    bstr(&mut out, &kind);
    bstr(&mut out, class_id);
    out
}

fn build(auth: &[u8], manifest: &[u8], payload: Option<&[u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    head(&mut out, 6, 107);
    head(&mut out, 5, if payload.is_some() { 3 } else { 2 });
    uint(&mut out, 2);
    bstr(&mut out, auth);
    uint(&mut out, 3);
    bstr(&mut out, manifest);
    if let Some(payload) = payload {
        tstr(&mut out, "#image");
        bstr(&mut out, payload);
    }
    out
}

/// Returns an envelope for `class_id`, signed with `signature`, carrying
/// `payload` as an integrated payload.
pub fn envelope(class_id: &[u8; 16], signature: &[u8], payload: &[u8]) -> Vec<u8> {
    build(&auth(signature), &manifest(class_id, 0), Some(payload))
}

/// Returns an envelope with no integrated payload, whose manifest is
/// padded by `padding` bytes.
pub fn envelope_with_manifest_padding(class_id: &[u8; 16], padding: usize) -> Vec<u8> {
    build(&auth(b"signature"), &manifest(class_id, padding), None)
}
