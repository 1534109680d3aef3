//! UPnP device description fetching and parsing.
//!
//! Every SSDP responder advertises a LOCATION URL pointing at a small XML
//! document describing the device and its services. This module fetches that
//! document (bounded by a short timeout) and extracts the handful of fields
//! the pipeline consumes: identity metadata for display/metrics, and the
//! AVTransport `controlURL` for SOAP control.
//!
//! The parser is deliberately forgiving: it matches elements by local name
//! (namespace prefixes ignored), skips whitespace and comments, and treats
//! every field as optional. Real-world renderer descriptions are small but
//! frequently malformed in minor ways.

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use reqwest::Client;

use super::types::{DiscoveryError, DiscoveryResult};
use crate::protocol_constants::DESCRIPTION_FETCH_TIMEOUT;

/// Identity fields harvested from a device description, in document order.
const IDENTITY_FIELDS: &[&str] = &[
    "friendlyName",
    "manufacturer",
    "manufacturerURL",
    "modelName",
    "modelNumber",
    "modelDescription",
    "serialNumber",
    "UDN",
    "deviceType",
    "presentationURL",
];

/// A `<service>` block from the description's service list.
#[derive(Debug, Clone, Default)]
pub struct ServiceEntry {
    /// Service URN (e.g. `urn:schemas-upnp-org:service:AVTransport:1`).
    pub service_type: String,
    /// Service identifier.
    pub service_id: String,
    /// Control URL path, preserved verbatim apart from trimming.
    pub control_url: String,
}

/// Parsed device description document.
#[derive(Debug, Clone, Default)]
pub struct DeviceDescription {
    /// Identity fields keyed by element name (only present elements).
    pub fields: HashMap<String, String>,
    /// All `<service>` blocks, in document order (nested devices included).
    pub services: Vec<ServiceEntry>,
}

impl DeviceDescription {
    /// Display name from the description, if present.
    #[must_use]
    pub fn friendly_name(&self) -> Option<&str> {
        self.fields.get("friendlyName").map(String::as_str)
    }

    /// Control URL of the first service whose type mentions AVTransport.
    ///
    /// The value is returned exactly as advertised (trim only); renderers are
    /// sensitive to path rewrites.
    #[must_use]
    pub fn av_transport_control_url(&self) -> Option<&str> {
        self.services
            .iter()
            .find(|s| s.service_type.contains("AVTransport"))
            .map(|s| s.control_url.as_str())
            .filter(|url| !url.is_empty())
    }

    /// Flattens the description into renderer metadata.
    ///
    /// Identity fields are copied through; the service list is summarized as
    /// a comma-joined `services` entry.
    #[must_use]
    pub fn metadata(&self) -> HashMap<String, String> {
        let mut meta = self.fields.clone();
        if !self.services.is_empty() {
            let list: Vec<&str> = self
                .services
                .iter()
                .map(|s| s.service_type.as_str())
                .filter(|t| !t.is_empty())
                .collect();
            meta.insert("services".to_string(), list.join(","));
        }
        meta
    }

    /// Concatenated description text used for kind classification.
    #[must_use]
    pub fn classification_text(&self) -> String {
        let mut text = String::new();
        for key in ["manufacturer", "modelName", "modelDescription", "deviceType"] {
            if let Some(v) = self.fields.get(key) {
                text.push_str(v);
                text.push(' ');
            }
        }
        text
    }
}

/// Fetches a device description document over HTTP.
///
/// Bounded by [`DESCRIPTION_FETCH_TIMEOUT`]; failures degrade the renderer to
/// its per-kind fallback control path, they never fail discovery.
pub async fn fetch_description(client: &Client, location: &str) -> DiscoveryResult<String> {
    let response = client
        .get(location)
        .timeout(DESCRIPTION_FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| DiscoveryError::XmlFetch(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DiscoveryError::XmlFetch(format!(
            "{} returned {}",
            location, status
        )));
    }

    response
        .text()
        .await
        .map_err(|e| DiscoveryError::XmlFetch(e.to_string()))
}

/// Parses a device description document.
///
/// Walks the document as an event stream, collecting identity fields and
/// `<service>` blocks by local element name.
pub fn parse_description(xml: &str) -> DiscoveryResult<DeviceDescription> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();

    let mut desc = DeviceDescription::default();
    let mut service: Option<ServiceEntry> = None;
    let mut current: Vec<u8> = Vec::new();
    let mut text_buf = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                current = e.local_name().as_ref().to_vec();
                if current == b"service" {
                    service = Some(ServiceEntry::default());
                }
                text_buf.clear();
            }
            Ok(Event::Text(ref t)) => {
                let chunk = t
                    .decode()
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| String::from_utf8_lossy(t.as_ref()).to_string());
                text_buf.push_str(&chunk);
            }
            Ok(Event::GeneralRef(ref r)) => {
                if let Ok(name) = r.decode() {
                    let entity = format!("&{name};");
                    match quick_xml::escape::unescape(&entity) {
                        Ok(resolved) => text_buf.push_str(&resolved),
                        Err(_) => text_buf.push_str(&entity),
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                let text = text_buf.trim();
                if !text.is_empty() {
                    if let Some(svc) = service.as_mut() {
                        match current.as_slice() {
                            b"serviceType" => svc.service_type = text.to_string(),
                            b"serviceId" => svc.service_id = text.to_string(),
                            b"controlURL" => svc.control_url = text.to_string(),
                            _ => {}
                        }
                    } else if let Some(&field) = IDENTITY_FIELDS
                        .iter()
                        .find(|&&f| f.as_bytes() == current.as_slice())
                    {
                        // First occurrence wins: nested sub-devices repeat fields
                        // and the root device is the authoritative one.
                        desc.fields
                            .entry(field.to_string())
                            .or_insert_with(|| text.to_string());
                    }
                }
                text_buf.clear();

                if e.local_name().as_ref() == b"service" {
                    if let Some(svc) = service.take() {
                        desc.services.push(svc);
                    }
                }
                current.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(DiscoveryError::XmlParse(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(desc)
}
