//! Choropleth map materialization.
//!
//! [`materialize`] turns a [`QueryResult`] into a [`MapArtifact`]:
//!
//! - **Value column**: the first non-id attribute column whose non-null
//!   values are all numeric (at least one non-null). With none, the map is
//!   an outline map (uniform fill, no legend).
//! - **Classes**: quantile breaks into up to `bins` classes over the
//!   sequential YlOrRd palette. Null or non-finite values are drawn in a
//!   neutral "no data" colour.
//! - **Tooltips**: region id first, then every attribute column.
//! - **Bounds**: the bounding box of all geometries; an empty result keeps
//!   the configured default center and zoom.
//!
//! Artifacts are exported as a GeoJSON `FeatureCollection` or as a
//! standalone Leaflet HTML page.

use geo_types::Geometry;
use serde::Serialize;
use serde_json::{json, Value as Json};

use crate::config::MapConfig;
use crate::geometry::{bounds, to_geojson};
use crate::models::QueryResult;

/// ColorBrewer YlOrRd, 9 classes.
const YL_OR_RD: [&str; 9] = [
    "#ffffcc", "#ffeda0", "#fed976", "#feb24c", "#fd8d3c", "#fc4e2a", "#e31a1c", "#bd0026",
    "#800026",
];
pub const NO_DATA_COLOR: &str = "#d9d9d9";
pub const OUTLINE_COLOR: &str = "#3388ff";
const NO_DATA_LABEL: &str = "no data";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegendClass {
    pub lower: f64,
    pub upper: f64,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Legend {
    pub title: String,
    pub classes: Vec<LegendClass>,
    pub no_data_color: String,
}

impl Legend {
    /// Colour for `value`; `None` and non-finite values get the no-data colour.
    pub fn color_for(&self, value: Option<f64>) -> &str {
        let Some(v) = value.filter(|v| v.is_finite()) else {
            return &self.no_data_color;
        };
        self.classes
            .iter()
            .find(|c| v <= c.upper)
            .or(self.classes.last())
            .map(|c| c.color.as_str())
            .unwrap_or(self.no_data_color.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct MapFeature {
    pub region_id: String,
    pub geometry: Option<Geometry<f64>>,
    pub value: Option<f64>,
    pub fill_color: String,
    /// `(field, text)` pairs in tooltip order.
    pub tooltip: Vec<(String, String)>,
}

/// A renderable choropleth.
#[derive(Debug, Clone)]
pub struct MapArtifact {
    pub features: Vec<MapFeature>,
    pub value_column: Option<String>,
    pub tooltip_fields: Vec<String>,
    pub legend: Option<Legend>,
    /// `[[south, west], [north, east]]`
    pub bounds: Option<[[f64; 2]; 2]>,
    /// `[lat, lon]`
    pub center: [f64; 2],
    pub zoom: u8,
}

impl MapArtifact {
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// GeoJSON `FeatureCollection`; the legend, bounds, and value column are
    /// carried as foreign members.
    pub fn to_geojson(&self) -> Json {
        let features: Vec<Json> = self
            .features
            .iter()
            .map(|f| {
                let tooltip: serde_json::Map<String, Json> = f
                    .tooltip
                    .iter()
                    .map(|(k, v)| (k.clone(), Json::String(v.clone())))
                    .collect();
                json!({
                    "type": "Feature",
                    "id": f.region_id,
                    "geometry": f.geometry.as_ref().map(to_geojson),
                    "properties": {
                        "region_id": f.region_id,
                        "value": f.value,
                        "fill_color": f.fill_color,
                        "tooltip": tooltip,
                    },
                })
            })
            .collect();

        json!({
            "type": "FeatureCollection",
            "features": features,
            "value_column": self.value_column,
            "legend": self.legend,
            "bounds": self.bounds,
            "center": self.center,
            "zoom": self.zoom,
        })
    }

    /// A standalone HTML page rendering the map with Leaflet.
    pub fn to_html(&self, title: &str) -> String {
        // `</` would end the inline script early.
        let data = self.to_geojson().to_string().replace("</", "<\\/");

        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html><head><meta charset='utf-8'>");
        html.push_str(&format!("<title>{}</title>", escape_html(title)));
        html.push_str(concat!(
            "<meta name='viewport' content='width=device-width, initial-scale=1'>",
            "<link rel='stylesheet' href='https://unpkg.com/leaflet@1.9.4/dist/leaflet.css'>",
            "<script src='https://unpkg.com/leaflet@1.9.4/dist/leaflet.js'></script>",
            "<style>html,body,#map{height:100%;margin:0;}",
            ".legend{background:#fff;padding:6px 8px;font:12px system-ui,sans-serif;line-height:18px;}",
            ".legend i{width:16px;height:16px;float:left;margin-right:6px;opacity:0.8;}</style>",
            "</head><body><div id='map'></div><script>\n",
        ));
        html.push_str(&format!("const data = {};\n", data));
        html.push_str(MAP_SCRIPT);
        html.push_str("</script></body></html>\n");
        html
    }
}

const MAP_SCRIPT: &str = r#"const esc = s => String(s).replace(/[&<>"']/g, c => ({'&':'&amp;','<':'&lt;','>':'&gt;','"':'&quot;',"'":'&#39;'}[c]));
const map = L.map('map').setView(data.center, data.zoom);
L.tileLayer('https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png', {
  maxZoom: 18,
  attribution: '&copy; OpenStreetMap contributors'
}).addTo(map);
const layer = L.geoJSON(data, {
  style: f => ({ fillColor: f.properties.fill_color, color: '#555', weight: 0.6, fillOpacity: 0.75 }),
  onEachFeature: (f, l) => l.bindTooltip(
    Object.entries(f.properties.tooltip).map(([k, v]) => '<b>' + esc(k) + '</b>: ' + esc(v)).join('<br>')
  )
}).addTo(map);
if (data.bounds) { map.fitBounds(data.bounds); }
if (data.legend) {
  const legend = L.control({ position: 'bottomright' });
  legend.onAdd = () => {
    const div = L.DomUtil.create('div', 'legend');
    let html = '<b>' + esc(data.legend.title) + '</b><br>';
    for (const c of data.legend.classes) {
      html += '<i style="background:' + c.color + '"></i>' + c.lower.toLocaleString() + ' &ndash; ' + c.upper.toLocaleString() + '<br>';
    }
    html += '<i style="background:' + data.legend.no_data_color + '"></i>no data';
    div.innerHTML = html;
    return div;
  };
  legend.addTo(map);
}
"#;

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Build the map artifact for `result`.
pub fn materialize(result: &QueryResult, config: &MapConfig) -> MapArtifact {
    let value_idx = value_column(result);
    let value_column = value_idx.map(|i| result.columns[i].name.clone());

    let values: Vec<Option<f64>> = result
        .features
        .iter()
        .map(|f| {
            value_idx
                .and_then(|i| f.attributes.get(i))
                .and_then(|v| v.as_f64())
                .filter(|v| v.is_finite())
        })
        .collect();

    let legend = value_column.as_ref().and_then(|title| {
        let present: Vec<f64> = values.iter().flatten().copied().collect();
        quantile_legend(title, &present, config.bins)
    });

    // Id first, then the remaining columns in result order.
    let mut tooltip_order: Vec<usize> = (0..result.columns.len())
        .filter(|&i| result.columns[i].is_id)
        .collect();
    tooltip_order.extend((0..result.columns.len()).filter(|&i| !result.columns[i].is_id));
    let tooltip_fields: Vec<String> = tooltip_order
        .iter()
        .map(|&i| result.columns[i].name.clone())
        .collect();

    let features: Vec<MapFeature> = result
        .features
        .iter()
        .zip(&values)
        .map(|(f, value)| {
            let fill_color = match &legend {
                Some(legend) => legend.color_for(*value).to_string(),
                None if value_column.is_some() => NO_DATA_COLOR.to_string(),
                None => OUTLINE_COLOR.to_string(),
            };
            let tooltip = tooltip_order
                .iter()
                .map(|&i| {
                    let text = match f.attributes.get(i) {
                        Some(v) if !v.is_null() => v.display(),
                        _ => NO_DATA_LABEL.to_string(),
                    };
                    (result.columns[i].name.clone(), text)
                })
                .collect();
            MapFeature {
                region_id: f.region_id.clone(),
                geometry: f.geometry.clone(),
                value: *value,
                fill_color,
                tooltip,
            }
        })
        .collect();

    let rect = bounds(features.iter().filter_map(|f| f.geometry.as_ref()));
    let bounds = rect.map(|r| [[r.min().y, r.min().x], [r.max().y, r.max().x]]);
    let center = rect
        .map(|r| [(r.min().y + r.max().y) / 2.0, (r.min().x + r.max().x) / 2.0])
        .unwrap_or(config.center);

    tracing::debug!(
        features = features.len(),
        value_column = ?value_column,
        classes = legend.as_ref().map(|l| l.classes.len()).unwrap_or(0),
        "map materialized"
    );

    MapArtifact {
        features,
        value_column,
        tooltip_fields,
        legend,
        bounds,
        center,
        zoom: config.zoom,
    }
}

/// Index of the column to colour by.
fn value_column(result: &QueryResult) -> Option<usize> {
    result.columns.iter().enumerate().position(|(i, c)| {
        if c.is_id {
            return false;
        }
        let mut seen = false;
        for f in &result.features {
            match f.attributes.get(i) {
                Some(v) if v.is_null() => {}
                Some(v) if v.is_numeric() => seen = true,
                Some(_) => return false,
                None => {}
            }
        }
        seen
    })
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    let idx = ((sorted.len() - 1) as f64 * q.clamp(0.0, 1.0)).round() as usize;
    sorted[idx]
}

/// Quantile classes over `values`; `None` when there is nothing to classify.
fn quantile_legend(title: &str, values: &[f64], bins: usize) -> Option<Legend> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let bins = bins.clamp(1, YL_OR_RD.len());
    let mut edges: Vec<f64> = (0..=bins)
        .map(|i| quantile(&sorted, i as f64 / bins as f64))
        .collect();
    edges.dedup();
    if edges.len() == 1 {
        edges.push(edges[0]);
    }

    let count = edges.len() - 1;
    let classes = edges
        .windows(2)
        .enumerate()
        .map(|(i, w)| LegendClass {
            lower: w[0],
            upper: w[1],
            color: palette_color(i, count).to_string(),
        })
        .collect();

    Some(Legend {
        title: title.to_string(),
        classes,
        no_data_color: NO_DATA_COLOR.to_string(),
    })
}

/// Spread `count` classes evenly over the palette.
fn palette_color(index: usize, count: usize) -> &'static str {
    if count <= 1 {
        return YL_OR_RD[YL_OR_RD.len() / 2];
    }
    let last = (YL_OR_RD.len() - 1) as f64;
    YL_OR_RD[(index as f64 * last / (count - 1) as f64).round() as usize]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::parse_wkt;
    use crate::models::{GeoFeature, ResultColumn, Value};

    fn square(x: f64, y: f64) -> Geometry<f64> {
        parse_wkt(&format!(
            "POLYGON(({x} {y}, {x1} {y}, {x1} {y1}, {x} {y1}, {x} {y}))",
            x = x,
            y = y,
            x1 = x + 0.1,
            y1 = y + 0.1
        ))
        .unwrap()
    }

    fn result(values: &[Value]) -> QueryResult {
        QueryResult {
            columns: vec![
                ResultColumn { name: "dicofre".into(), is_id: true },
                ResultColumn { name: "freguesia".into(), is_id: false },
                ResultColumn { name: "pct_women".into(), is_id: false },
            ],
            features: values
                .iter()
                .enumerate()
                .map(|(i, v)| GeoFeature {
                    region_id: format!("1106{:02}", i),
                    geometry: Some(square(-9.2 + i as f64 * 0.1, 38.7)),
                    attributes: vec![
                        Value::Text(format!("1106{:02}", i)),
                        Value::Text(format!("Parish {}", i)),
                        v.clone(),
                    ],
                })
                .collect(),
        }
    }

    #[test]
    fn colours_by_first_numeric_column() {
        let values: Vec<Value> = (0..12).map(|i| Value::Float(50.0 + i as f64)).collect();
        let map = materialize(&result(&values), &MapConfig::default());
        assert_eq!(map.value_column.as_deref(), Some("pct_women"));
        let legend = map.legend.as_ref().unwrap();
        assert_eq!(legend.classes.len(), 6);
        assert_eq!(legend.classes[0].color, YL_OR_RD[0]);
        assert_eq!(legend.classes[5].color, YL_OR_RD[8]);
        assert_eq!(map.features[0].fill_color, YL_OR_RD[0]);
        assert_eq!(map.features[11].fill_color, YL_OR_RD[8]);
        assert_eq!(map.tooltip_fields, vec!["dicofre", "freguesia", "pct_women"]);
    }

    #[test]
    fn nulls_get_no_data_colour() {
        let map = materialize(
            &result(&[Value::Float(1.0), Value::Null, Value::Float(3.0)]),
            &MapConfig::default(),
        );
        assert_eq!(map.features[1].fill_color, NO_DATA_COLOR);
        assert_eq!(map.features[1].tooltip[2].1, "no data");
        assert_ne!(map.features[0].fill_color, NO_DATA_COLOR);
    }

    #[test]
    fn text_only_result_is_an_outline_map() {
        let map = materialize(
            &result(&[Value::Text("a".into()), Value::Text("b".into())]),
            &MapConfig::default(),
        );
        assert!(map.value_column.is_none());
        assert!(map.legend.is_none());
        assert!(map.features.iter().all(|f| f.fill_color == OUTLINE_COLOR));
    }

    #[test]
    fn empty_result_is_a_valid_map() {
        let config = MapConfig::default();
        let map = materialize(&QueryResult::default(), &config);
        assert!(map.is_empty());
        assert!(map.bounds.is_none());
        assert_eq!(map.center, config.center);
        let geojson = map.to_geojson();
        assert_eq!(geojson["features"].as_array().unwrap().len(), 0);
        assert!(map.to_html("empty").contains("L.map('map')"));
    }

    #[test]
    fn constant_values_form_one_class() {
        let map = materialize(
            &result(&[Value::Int(7), Value::Int(7), Value::Int(7)]),
            &MapConfig::default(),
        );
        let legend = map.legend.unwrap();
        assert_eq!(legend.classes.len(), 1);
        assert_eq!(legend.classes[0].lower, 7.0);
    }

    #[test]
    fn bounds_cover_features() {
        let map = materialize(
            &result(&[Value::Int(1), Value::Int(2)]),
            &MapConfig::default(),
        );
        let [[south, west], [north, east]] = map.bounds.unwrap();
        assert!((west - -9.2).abs() < 1e-9);
        assert!((east - -9.0).abs() < 1e-9);
        assert!((south - 38.7).abs() < 1e-9);
        assert!((north - 38.8).abs() < 1e-9);
    }

    #[test]
    fn html_escapes_title_and_script_breaks() {
        let mut r = result(&[Value::Int(1)]);
        r.features[0].attributes[1] = Value::Text("</script><b>".into());
        let html = materialize(&r, &MapConfig::default()).to_html("<Lisboa>");
        assert!(html.contains("<title>&lt;Lisboa&gt;</title>"));
        assert!(!html.contains("</script><b>"));
    }
}
