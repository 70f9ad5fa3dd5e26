use crate::metrics::types::{Labels, MetricPoint};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Renders metric points in the Prometheus text exposition format.
/// `# HELP` and `# TYPE` are written once per metric name; names and labels
/// are ordered so the output is stable across scrapes.
pub fn render_prometheus(points: &[MetricPoint]) -> String {
    let mut by_name: BTreeMap<&'static str, Vec<&MetricPoint>> = BTreeMap::new();
    for point in points {
        by_name.entry(point.name).or_default().push(point);
    }

    let mut output = String::new();
    for (name, points) in by_name {
        let first = points[0];
        let _ = writeln!(output, "# HELP {name} {}", first.help);
        let _ = writeln!(output, "# TYPE {name} {}", first.kind.as_str());
        for point in points {
            let _ = writeln!(
                output,
                "{name}{} {}",
                render_labels(&point.labels),
                point.value.as_f64()
            );
        }
    }
    output
}

fn render_labels(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let rendered = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{rendered}}}")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
