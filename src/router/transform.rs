//! Field Transforms
//!
//! A transform turns one extracted field value into the topic and payload
//! that get published for it.

use crate::config::ParamConversion;

/// Converts a single field value into an outbound `(topic, payload)` pair
pub trait Transform: Send + Sync {
    fn apply(&self, conversion: &ParamConversion, value: f64) -> (String, String);
}

/// Scales values by 1000 and publishes them under `<name>/<suffix>`
#[derive(Debug, Clone)]
pub struct MilliScale {
    bridge_name: String,
}

impl MilliScale {
    pub fn new(bridge_name: impl Into<String>) -> Self {
        Self {
            bridge_name: bridge_name.into(),
        }
    }
}

impl Transform for MilliScale {
    fn apply(&self, conversion: &ParamConversion, value: f64) -> (String, String) {
        (
            format!("{}/{}", self.bridge_name, conversion.suffix),
            to_milli(value),
        )
    }
}

/// Render `value * 1000` as a decimal integer string.
///
/// Rounds half to even, so exact ties go to the even neighbour (`2.5 -> 2`,
/// `3.5 -> 4`). Results that round to zero render as `"0"`, never `"-0"`.
pub fn to_milli(value: f64) -> String {
    render_integral(value * 1000.0)
}

fn render_integral(scaled: f64) -> String {
    let rounded = scaled.round_ties_even();
    if rounded == 0.0 {
        "0".to_string()
    } else {
        format!("{:.0}", rounded)
    }
}
