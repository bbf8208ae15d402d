// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

/// Test-only macro for building (potentially malformed!) CBOR fixtures.
///
/// ```
/// raw_cbor! {
///   // Single-token expressions implementing AsRef<[u8]> are copied as-is.
///   "INSTLD_MFST"
///
///   // Hex literal, spaces ignored.
///   h"bf ff"
///
///   // Header of major `type` with argument `value`, minimally encoded.
///   type:value
///
///   // Header of major `type` whose argument is the byte length of
///   // `tokens`, followed by `tokens`. Useful for bstr-wrapped CBOR.
///   type { tokens }
///
///   // Header of major `type` whose argument is the number of
///   // comma-terminated groups, followed by the groups. For a map, each
///   // group is one key-value pair.
///   type [ tokens, tokens, ]
///
///   // Any of the above with the argument forced to `len` bytes, the way
///   // fixed-width lengths are laid out in NVM.
///   type@len:value
///   type@len { tokens }
/// }
/// ```
macro_rules! raw_cbor {
    (@width) => { None };
    (@width $len:tt) => { Some($len) };
    (@parse[$out:tt, $count:tt] $ty:tt$(@$len:tt)? {$($tt:tt)*} $($rest:tt)*) => {{
        let inner = raw_cbor!($($tt)*);
        raw_cbor!(@parse[$out, None] $ty$(@$len)?:(inner.len() as u64));
        $out.extend_from_slice(&inner);

        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt] $ty:tt$(@$len:tt)? [] $($rest:tt)*) => {{
        raw_cbor!(@parse[$out, None] $ty$(@$len)?:0);
        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt] $ty:tt$(@$len:tt)? [$($tt:tt)*] $($rest:tt)*) => {{
        let mut inner = Vec::<u8>::new();
        let mut count = 1;
        raw_cbor!(@parse[inner, (Some(&mut count))] $($tt)*);
        raw_cbor!(@parse[$out, None] $ty$(@$len)?:count);
        $out.extend_from_slice(&inner);

        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt] $ty:tt$(@$len:tt)?:$arg:tt $($rest:tt)*) => {{
        let width: Option<u8> = raw_cbor!(@width $($len)?);
        $crate::cbor::macros::push_header(&mut $out, $ty, width, $arg);

        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt] ,) => {{
        let _ = $count.unwrap();
    }};
    (@parse[$out:tt, $count:tt] , $($rest:tt)*) => {{
        *$count.unwrap() += 1;
        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt] h$imm:tt $($rest:tt)*) => {{
        let digits: Vec<u8> = $imm
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        for pair in digits.chunks(2) {
            let pair = std::str::from_utf8(pair).unwrap();
            $out.push(u8::from_str_radix(pair, 16).unwrap());
        }

        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt] $imm:tt $($rest:tt)*) => {{
        $out.extend_from_slice($imm.as_ref());
        raw_cbor!(@parse[$out, $count] $($rest)*);
    }};
    (@parse[$out:tt, $count:tt]) => {{}};
    ($($tokens:tt)*) => {{
        let mut out = Vec::<u8>::new();
        #[allow(unused)] let _ = raw_cbor!(@parse[out, None] $($tokens)*);
        out
    }};
}

/// Appends a header of major type `major` to `out`.
///
/// `width` forces the argument to take exactly that many bytes after the
/// initial byte; `Some(0)` packs it into the initial byte.
pub(crate) fn push_header(
    out: &mut Vec<u8>,
    major: u8,
    width: Option<u8>,
    arg: u64,
) {
    assert!(major < 8, "bad major type {}", major);
    let width = width.unwrap_or(match arg {
        0..=23 => 0,
        24..=0xff => 1,
        0x100..=0xffff => 2,
        0x1_0000..=0xffff_ffff => 4,
        _ => 8,
    });

    let (extra, info) = match width {
        0 => (0, arg),
        1 => (1, 24),
        2 => (2, 25),
        4 => (4, 26),
        8 => (8, 27),
        w => panic!("bad argument width {}", w),
    };
    assert!(info < 32, "argument {} does not fit the initial byte", arg);
    assert!(
        extra == 0 || extra == 8 || arg >> (8 * extra) == 0,
        "argument {} does not fit in {} bytes",
        arg,
        extra
    );
    out.push(major << 5 | info as u8);
    out.extend_from_slice(&arg.to_be_bytes()[8 - extra..]);
}

#[test]
fn test() {
    assert_eq!(raw_cbor!(0:5), [0x05]);
    assert_eq!(raw_cbor!(0:24), [0x18, 24]);
    assert_eq!(raw_cbor!(6:107), [0xd8, 107]);
    assert_eq!(raw_cbor!(1:256), [0x39, 1, 0]);
    assert_eq!(raw_cbor!(2@2:3), [0x59, 0, 3]);
    assert_eq!(raw_cbor!(2@4:0xffff_ffff), [0x5a, 0xff, 0xff, 0xff, 0xff]);

    assert_eq!(raw_cbor!(3 { "a.bin" }), b"\x65a.bin");
    assert_eq!(raw_cbor!(h"bf ff"), [0xbf, 0xff]);

    assert_eq!(raw_cbor!(4 []), [0x80]);
    assert_eq!(
        raw_cbor!(5 [ 0:2 2 { "x" }, 0:3 2 {}, ]),
        [0xa2, 0x02, 0x41, b'x', 0x03, 0x40]
    );
}
