//! SOAP envelope construction for UPnP AVTransport actions.
//!
//! Envelopes are hand-built strings rather than serialized XML: the layout
//! (line breaks, single-space indentation, attribute order, namespace
//! prefixes, the empty `CurrentURIMetaData` element) is a byte-exact wire
//! contract. Several renderer firmwares parse these bodies with regexes and
//! reject cosmetic variations.

use crate::protocol_constants::AVTRANSPORT_URN;
use crate::utils::escape_xml;

/// An AVTransport action the control client can issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvAction {
    /// Point the renderer at a media URL (`SetAVTransportURI`).
    SetUri {
        /// Absolute URL of the clip endpoint.
        uri: String,
    },
    /// Start playback at speed 1.
    Play,
    /// Stop playback.
    Stop,
}

impl AvAction {
    /// UPnP action name as it appears in the envelope and SOAPAction header.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetUri { .. } => "SetAVTransportURI",
            Self::Play => "Play",
            Self::Stop => "Stop",
        }
    }

    /// Value for the `SOAPAction` header, including the required quotes.
    #[must_use]
    pub fn soap_action_header(&self) -> String {
        format!("\"{}#{}\"", AVTRANSPORT_URN, self.name())
    }

    /// Ordered argument list for the envelope body.
    fn args(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::SetUri { uri } => vec![
                ("InstanceID", "0".to_string()),
                ("CurrentURI", escape_xml(uri)),
                ("CurrentURIMetaData", String::new()),
            ],
            Self::Play => vec![
                ("InstanceID", "0".to_string()),
                ("Speed", "1".to_string()),
            ],
            Self::Stop => vec![("InstanceID", "0".to_string())],
        }
    }

    /// Renders the SOAP 1.1 envelope for this action.
    #[must_use]
    pub fn envelope(&self) -> String {
        build_envelope(self.name(), &self.args())
    }
}

/// Builds an AVTransport SOAP envelope with the exact canonical layout.
fn build_envelope(action: &str, args: &[(&'static str, String)]) -> String {
    let mut body = String::with_capacity(512);
    body.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    body.push_str(
        "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\n",
    );
    body.push_str(" <s:Body>\n");
    body.push_str(&format!("  <u:{} xmlns:u=\"{}\">\n", action, AVTRANSPORT_URN));
    for (key, value) in args {
        body.push_str(&format!("   <{key}>{value}</{key}>\n"));
    }
    body.push_str(&format!("  </u:{}>\n", action));
    body.push_str(" </s:Body>\n");
    body.push_str("</s:Envelope>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_uri_envelope_is_byte_exact() {
        let action = AvAction::SetUri {
            uri: "http://192.168.4.77:8080/media/current".to_string(),
        };
        let expected = concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n",
            "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" ",
            "s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\n",
            " <s:Body>\n",
            "  <u:SetAVTransportURI xmlns:u=\"urn:schemas-upnp-org:service:AVTransport:1\">\n",
            "   <InstanceID>0</InstanceID>\n",
            "   <CurrentURI>http://192.168.4.77:8080/media/current</CurrentURI>\n",
            "   <CurrentURIMetaData></CurrentURIMetaData>\n",
            "  </u:SetAVTransportURI>\n",
            " </s:Body>\n",
            "</s:Envelope>",
        );
        assert_eq!(action.envelope(), expected);
    }

    #[test]
    fn play_envelope_is_byte_exact() {
        let expected = concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n",
            "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" ",
            "s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\n",
            " <s:Body>\n",
            "  <u:Play xmlns:u=\"urn:schemas-upnp-org:service:AVTransport:1\">\n",
            "   <InstanceID>0</InstanceID>\n",
            "   <Speed>1</Speed>\n",
            "  </u:Play>\n",
            " </s:Body>\n",
            "</s:Envelope>",
        );
        assert_eq!(AvAction::Play.envelope(), expected);
    }

    #[test]
    fn stop_envelope_carries_instance_only() {
        let envelope = AvAction::Stop.envelope();
        assert!(envelope.contains("<u:Stop xmlns:u=\"urn:schemas-upnp-org:service:AVTransport:1\">"));
        assert!(envelope.contains("<InstanceID>0</InstanceID>"));
        assert!(!envelope.contains("Speed"));
    }

    #[test]
    fn soap_action_header_is_quoted() {
        assert_eq!(
            AvAction::Play.soap_action_header(),
            "\"urn:schemas-upnp-org:service:AVTransport:1#Play\""
        );
        let set = AvAction::SetUri { uri: "x".into() };
        assert_eq!(
            set.soap_action_header(),
            "\"urn:schemas-upnp-org:service:AVTransport:1#SetAVTransportURI\""
        );
    }

    #[test]
    fn uri_is_xml_escaped() {
        let action = AvAction::SetUri {
            uri: "http://host/clip?a=1&b=2".to_string(),
        };
        let envelope = action.envelope();
        assert!(envelope.contains("<CurrentURI>http://host/clip?a=1&amp;b=2</CurrentURI>"));
        assert!(!envelope.contains("a=1&b"));
    }
}
