// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Recording why the system halted.
//!
//! When a fault policy decides to halt everything, the kernel writes an
//! "epitaph" describing the event into a fixed buffer, truncating if it
//! doesn't fit. Writing never fails and never panics, since by then there's
//! nobody left to report a second failure to.

use core::fmt::{Display, Write};

pub const EPITAPH_LEN: usize = 128;

#[derive(Clone)]
pub struct Epitaph {
    buf: [u8; EPITAPH_LEN],
    len: usize,
}

impl Epitaph {
    pub fn new(msg: impl Display) -> Self {
        let mut buf = [0; EPITAPH_LEN];
        let mut writer = Eulogist { dest: &mut buf[..] };
        write!(writer, "{msg}").ok();
        let len = EPITAPH_LEN - writer.dest.len();
        Self { buf, len }
    }

    /// The recorded text. A character cut in half by truncation is dropped.
    pub fn as_str(&self) -> &str {
        let bytes = &self.buf[..self.len];
        match core::str::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => core::str::from_utf8(&bytes[..e.valid_up_to()])
                .unwrap_or_default(),
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.len == EPITAPH_LEN
    }
}

impl core::fmt::Debug for Epitaph {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("Epitaph").field(&self.as_str()).finish()
    }
}

struct Eulogist<'a> {
    dest: &'a mut [u8],
}

impl Write for Eulogist<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_fits() {
        let e = Epitaph::new(format_args!("halted by {}", "net"));
        assert_eq!(e.as_str(), "halted by net");
        assert!(!e.is_truncated());
    }

    #[test]
    fn long_message_truncates() {
        let long = "x".repeat(300);
        let e = Epitaph::new(&long);
        assert_eq!(e.as_str().len(), EPITAPH_LEN);
        assert!(e.is_truncated());
    }

    #[test]
    fn split_character_is_dropped() {
        let mut msg = "a".repeat(EPITAPH_LEN - 1);
        msg.push('é');
        let e = Epitaph::new(&msg);
        assert_eq!(e.as_str(), &msg[..EPITAPH_LEN - 1]);
    }
}
