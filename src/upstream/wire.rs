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

use crate::{error::Result, MAX_LEN};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use bytes::{Bytes, BytesMut};
use domain::{
    base::{opt::AllOptData, Message, MessageBuilder, ShortBuf},
    rdata::AllRecordData,
};

/// Copy `msg` with the given id. Per RFC 8484, queries go on the wire with id 0 to
/// better facilitate HTTPS caching; the caller's id is put back before the message is
/// handed out again.
pub(super) fn with_id(msg: &Message<Bytes>, id: u16) -> Result<Message<Bytes>> {
    let mut msg = Message::from_octets(BytesMut::from(msg.as_slice()))?;
    msg.header_mut().set_id(id);
    Ok(Message::from_octets(msg.into_octets().freeze())?)
}

/// The unpadded base64url form of the wire message, used as the `dns` query parameter.
pub(super) fn encode_query(msg: &Message<Bytes>) -> String {
    URL_SAFE_NO_PAD.encode(msg.as_slice())
}

/// Parse an HTTP response body into a DNS message.
pub(super) fn unpack(body: Bytes) -> Result<Message<Bytes>> {
    Ok(Message::from_octets(body)?)
}

/// Rebuild `msg` with `extra` EDNS0 options appended to its OPT record. An OPT record is
/// created when the message doesn't carry one yet; if it does, its options are copied and
/// the new ones go after them. Only one OPT record ever survives, per RFC 6891.
pub(super) fn append_options(
    msg: &Message<Bytes>,
    extra: &[AllOptData<Bytes>],
) -> Result<Message<Bytes>> {
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))?;
    // Copy header
    *builder.header_mut() = msg.header();

    // Copy questions
    let mut builder = builder.question();
    for item in msg.question().flatten() {
        builder.push(item)?;
    }

    // Copy answer and authority sections
    let mut builder = builder.answer();
    for item in msg.answer()? {
        if let Some(record) = item?.into_record::<AllRecordData<_, _>>()? {
            builder.push(record)?;
        }
    }

    let mut builder = builder.authority();
    for item in msg.authority()? {
        if let Some(record) = item?.into_record::<AllRecordData<_, _>>()? {
            builder.push(record)?;
        }
    }

    let mut builder = builder.additional();
    // Whether we have already seen an OPT record.
    let mut flag = false;
    for item in msg.additional()? {
        if let Some(record) = item?.into_record::<AllRecordData<_, _>>()? {
            match (record.data(), flag) {
                (AllRecordData::Opt(opt), false) => {
                    builder.opt(|builder| {
                        for option in opt.iter::<AllOptData<_>>() {
                            let option = option.map_err(|_| ShortBuf)?;
                            builder.push(&option)?;
                        }
                        for option in extra {
                            builder.push(option)?;
                        }
                        Ok(())
                    })?;
                    flag = true;
                }
                // We have already pushed back one OPT record, DON'T copy another
                (AllRecordData::Opt(_), true) => {}
                (_, _) => {
                    builder.push(record)?;
                }
            }
        }
    }
    if !flag {
        builder.opt(|builder| {
            for option in extra {
                builder.push(option)?;
            }
            Ok(())
        })?;
    }
    Ok(builder.into_message())
}
