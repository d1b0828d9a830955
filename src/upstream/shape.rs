// Copyright 2022 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Traffic shaping for DPI resistance: browser-like headers, size-quantizing EDNS0
//! padding, and a watermark option.

use super::wire;
use crate::error::Result;
use bytes::Bytes;
use domain::base::{
    iana::OptionCode,
    opt::{AllOptData, UnknownOptData},
    Message,
};
use http::{header, HeaderMap, HeaderValue};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::sync::Mutex;

// Firefox on Windows, the most common browser profile DoH traffic hides among.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:127.0) Gecko/20100101 Firefox/127.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:128.0) Gecko/20100101 Firefox/128.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:129.0) Gecko/20100101 Firefox/129.0",
];

/// The DoH media type, per RFC 8484.
pub(super) const MIME_DNS_MESSAGE: &str = "application/dns-message";

// Padded messages end up at a multiple of 8 within this window.
const PAD_TARGET_MIN: usize = 128;
const PAD_TARGET_MAX: usize = 192;

// Wire cost of an empty OPT record: root name, type, class, ttl, rdlen.
const OPT_SHELL: usize = 11;
// Wire cost of one option header: code and length.
const OPT_HEADER: usize = 4;

/// Which header policy an outgoing request gets.
///
/// Both paths overlay browser-like headers and then win `Accept` back for the DoH content
/// negotiation; they deliberately differ on `User-Agent`. Single-shot queries blank it,
/// so they carry no client identity at all. Batched queries keep the randomized browser
/// one, so the burst blends into ordinary web traffic.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShapingMode {
    /// One query per request; anonymize by clearing `User-Agent`.
    Single,
    /// Part of a batch; camouflage with the randomized `User-Agent`.
    Batched,
}

// Centralized stealth shaping. One instance per upstream with its own RNG, so tests can
// pin the seed and nothing random happens at process initialization.
pub(super) struct Shaper {
    rng: Mutex<SmallRng>,
}

impl Shaper {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }

    /// The header overlay for one outgoing request.
    pub fn headers(&self, mode: ShapingMode) -> HeaderMap {
        let agent = {
            let mut rng = self.rng.lock().unwrap();
            USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())]
        };

        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(agent));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );

        // The DoH content negotiation always wins the final pass.
        headers.insert(header::ACCEPT, HeaderValue::from_static(MIME_DNS_MESSAGE));
        if mode == ShapingMode::Single {
            headers.remove(header::USER_AGENT);
        }
        headers
    }

    /// Pad the query up to a quantized target size and append the watermark option.
    /// Callers treat failures as cosmetic: the unshaped query is still perfectly valid.
    pub fn pad_and_mark(&self, msg: &Message<Bytes>) -> Result<Message<Bytes>> {
        let (target, watermark_code, watermark_byte) = {
            let mut rng = self.rng.lock().unwrap();
            (
                pad_target(&mut rng),
                // Local-use EDNS0 code space, acting as a cover-traffic differentiator.
                rng.gen_range(65000..65536) as u16,
                rng.gen::<u8>(),
            )
        };

        let mut extra = Vec::with_capacity(2);
        // Adding options to a message without an OPT record also costs the record shell.
        let current = msg.as_slice().len() + if msg.opt().is_some() { 0 } else { OPT_SHELL };
        if let Some(fill) = target.checked_sub(current + OPT_HEADER) {
            extra.push(AllOptData::<Bytes>::Other(UnknownOptData::from_octets(
                OptionCode::Padding,
                Bytes::from(vec![0u8; fill]),
            )));
        }
        extra.push(AllOptData::Other(UnknownOptData::from_octets(
            OptionCode::from_int(watermark_code),
            Bytes::from(vec![0x00, watermark_byte]),
        )));

        wire::append_options(msg, &extra)
    }
}

// Uniform over the window, floored to a multiple of 8.
fn pad_target(rng: &mut SmallRng) -> usize {
    rng.gen_range(PAD_TARGET_MIN..PAD_TARGET_MAX) & !7
}
