// Copyright (C) 2026 the ripcap authors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded hex dumps for error messages and `Debug` impls, so a hostile
//! 64 KiB data message can't flood the log.

use pretty_hex::PrettyHex;

pub struct LimitedHex<'a> {
    data: &'a [u8],
    limit: usize,
}

impl<'a> LimitedHex<'a> {
    pub fn new(data: &'a [u8], limit: usize) -> Self {
        Self { data, limit }
    }
}

impl<'a> std::fmt::Debug for LimitedHex<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = std::cmp::min(self.data.len(), self.limit);
        writeln!(f, "Length: {0} (0x{0:x}) bytes", self.data.len())?;
        write!(
            f,
            "{:?}",
            self.data[..shown].hex_conf(pretty_hex::HexConfig {
                title: false,
                ..Default::default()
            })
        )?;
        if shown < self.data.len() {
            write!(f, "\n...{} more bytes...", self.data.len() - shown)?;
        }
        Ok(())
    }
}
