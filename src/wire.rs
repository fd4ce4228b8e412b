//! Wire codec: flat XML documents and query strings.
//!
//! The shared-secret network speaks single-level XML (`<xml><k>v</k></xml>`);
//! the asymmetric-signature network speaks percent-encoded query strings.
//! Both directions round-trip: `from_xml(to_xml(m)) == m` for string-valued
//! mappings.

use std::collections::BTreeMap;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use quick_xml::events::{BytesCData, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{GatewayError, GatewayResult};

/// Free-text field that the counterparty expects inside a CDATA section.
const CDATA_FIELD: &str = "detail";

const ROOT: &str = "xml";

/// `application/x-www-form-urlencoded` escape set.
const FORM: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'*')
    .remove(b'-')
    .remove(b'.')
    .remove(b'_');

/// Encodes a mapping as a UTF-8 XML document with sorted keys under a
/// single `<xml>` root. The designated free-text field is wrapped in CDATA
/// unless the value already carries the wrapper.
pub fn to_xml(params: &BTreeMap<String, String>) -> GatewayResult<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    write_event(&mut writer, Event::Start(BytesStart::new(ROOT)))?;
    for (key, value) in params {
        write_event(&mut writer, Event::Start(BytesStart::new(key.as_str())))?;
        if key == CDATA_FIELD {
            if value.starts_with("<![CDATA[") {
                // Already wrapped by the caller; emit verbatim.
                write_event(
                    &mut writer,
                    Event::Text(BytesText::from_escaped(value.as_str())),
                )?;
            } else {
                write_event(&mut writer, Event::CData(BytesCData::new(value.as_str())))?;
            }
        } else {
            write_event(&mut writer, Event::Text(BytesText::new(value.as_str())))?;
        }
        write_event(&mut writer, Event::End(BytesEnd::new(key.as_str())))?;
    }
    write_event(&mut writer, Event::End(BytesEnd::new(ROOT)))?;
    Ok(writer.into_inner())
}

fn write_event(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> GatewayResult<()> {
    writer
        .write_event(event)
        .map_err(|e| GatewayError::WireDecoding {
            message: format!("failed to write XML event: {}", e),
        })
}

/// Parses a flat XML document back into a key/value mapping, unwrapping the
/// root element. Malformed or nested documents are a `WireDecoding` error.
pub fn from_xml(raw: &[u8]) -> GatewayResult<BTreeMap<String, String>> {
    let mut reader = Reader::from_reader(raw);

    let mut params = BTreeMap::new();
    let mut in_root = false;
    let mut current_key: Option<String> = None;
    let mut current_value = String::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| GatewayError::WireDecoding {
                message: format!("malformed XML response: {}", e),
            })?;
        match event {
            Event::Start(start) => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                if !in_root {
                    in_root = true;
                } else if current_key.is_none() {
                    current_key = Some(name);
                    current_value.clear();
                } else {
                    return Err(GatewayError::WireDecoding {
                        message: format!("unexpected nested element <{}>", name),
                    });
                }
            }
            Event::Empty(start) => {
                if in_root {
                    let name =
                        String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
                    params.insert(name, String::new());
                }
            }
            Event::Text(text) => {
                let value = text.unescape().map_err(|e| GatewayError::WireDecoding {
                    message: format!("undecodable XML text: {}", e),
                })?;
                if current_key.is_some() {
                    current_value.push_str(&value);
                } else if !value.trim().is_empty() {
                    return Err(GatewayError::WireDecoding {
                        message: "unexpected text outside an element".to_string(),
                    });
                }
            }
            Event::CData(cdata) => {
                if current_key.is_some() {
                    current_value.push_str(&String::from_utf8_lossy(&cdata.into_inner()));
                }
            }
            Event::End(_) => {
                if let Some(key) = current_key.take() {
                    params.insert(key, std::mem::take(&mut current_value));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !in_root {
        return Err(GatewayError::WireDecoding {
            message: "response body contains no XML document".to_string(),
        });
    }
    Ok(params)
}

/// Percent-encodes a mapping as a query string in ascending key order.
pub fn to_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, FORM),
                utf8_percent_encode(v, FORM)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Decodes a form/query-encoded payload into a mapping. `+` is treated as a
/// space per form encoding.
pub fn from_query(raw: &str) -> GatewayResult<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(decode_component(key)?, decode_component(value)?);
    }
    Ok(params)
}

fn decode_component(raw: &str) -> GatewayResult<String> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .map_err(|_| GatewayError::WireDecoding {
            message: "query component is not valid UTF-8".to_string(),
        })
}
