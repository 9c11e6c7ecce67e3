use eds_client::Datapoint;
use roxmltree::{Document, Node};
use time::OffsetDateTime;

use crate::pipeline::PipelineError;

/// Device family names reported in the `Name` element.
const THERMOMETER: &str = "DS18B20";
const COUNTER: &str = "DS2423";

/// Parse a device detail document into a `Datapoint` stamped with `acquired_at`.
///
/// Every element carrying a `Name` child is a device family. Thermometers
/// contribute `Temperature`, counters contribute `Counter_A`; other families are
/// skipped. A missing or malformed field leaves the zero default in place, but a
/// document that is not well-formed XML is an error.
pub fn parse_device_detail(body: &str, acquired_at: OffsetDateTime) -> Result<Datapoint, PipelineError> {
    let doc = Document::parse(body).map_err(|e| PipelineError::Parse(e.to_string()))?;

    let mut dp = Datapoint::new(acquired_at);
    for family in doc.descendants().filter(Node::is_element) {
        let Some(name) = child_text(family, "Name") else {
            continue;
        };

        match name {
            THERMOMETER => {
                if let Some(v) = child_text(family, "Temperature").and_then(|s| s.parse::<f64>().ok()) {
                    dp.temperature = v;
                } else {
                    tracing::debug!(family = name, "temperature missing or unparseable");
                    dp.temperature = 0.0;
                }
            }
            COUNTER => {
                if let Some(v) = child_text(family, "Counter_A").and_then(|s| s.parse::<i64>().ok()) {
                    dp.watt_hours = v;
                } else {
                    tracing::debug!(family = name, "counter missing or unparseable");
                    dp.watt_hours = 0;
                }
            }
            _ => {}
        }
    }

    Ok(dp)
}

/// Trimmed text of the first child element called `tag`.
fn child_text<'a>(node: Node<'a, '_>, tag: &str) -> Option<&'a str> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == tag)
        .map(|n| n.text().unwrap_or("").trim())
}
