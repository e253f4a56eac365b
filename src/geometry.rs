//! Geometry parsing, checking, and GeoJSON conversion.
//!
//! Backends hand geometries over as WKT text in WGS84 longitude/latitude
//! (EPSG:4326). Region geometries must be polygonal with closed, simple
//! rings and coordinates inside the lon/lat domain; anything else is reported
//! as an invalid geometry.

use geo::algorithm::line_intersection::{line_intersection, LineIntersection};
use geo::BoundingRect;
use geo_types::{Coord, Geometry, Line, LineString, Polygon, Rect};
use serde_json::{json, Value as Json};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum GeometryError {
    #[error("WKT parse error: {0}")]
    WktParse(String),

    #[error("invalid geometry: {0}")]
    Invalid(String),
}

/// Parse WKT text into a geo-types geometry.
pub fn parse_wkt(wkt: &str) -> Result<Geometry<f64>, GeometryError> {
    use std::str::FromStr;
    wkt::Wkt::from_str(wkt.trim())
        .map_err(|e| GeometryError::WktParse(e.to_string()))
        .and_then(|w| {
            w.try_into()
                .map_err(|e: wkt::conversion::Error| GeometryError::WktParse(format!("{:?}", e)))
        })
}

/// Parse WKT and check it is a usable region geometry.
pub fn parse_region(wkt: &str) -> Result<Geometry<f64>, GeometryError> {
    let geom = parse_wkt(wkt)?;
    check_region(&geom)?;
    Ok(geom)
}

/// Region geometries are polygons or multipolygons with closed rings of at
/// least four positions, all inside the WGS84 lon/lat domain, and no ring
/// crossing or touching itself.
pub fn check_region(geom: &Geometry<f64>) -> Result<(), GeometryError> {
    match geom {
        Geometry::Polygon(p) => check_polygon(p),
        Geometry::MultiPolygon(mp) => {
            if mp.0.is_empty() {
                return Err(GeometryError::Invalid("empty multipolygon".to_string()));
            }
            mp.0.iter().try_for_each(check_polygon)
        }
        other => Err(GeometryError::Invalid(format!(
            "expected a polygon or multipolygon, got {}",
            geometry_type(other)
        ))),
    }
}

fn check_polygon(p: &Polygon<f64>) -> Result<(), GeometryError> {
    std::iter::once(p.exterior())
        .chain(p.interiors().iter())
        .try_for_each(check_ring)
}

fn check_ring(ring: &LineString<f64>) -> Result<(), GeometryError> {
    if ring.0.len() < 4 {
        return Err(GeometryError::Invalid(format!(
            "ring has {} positions, at least 4 are required",
            ring.0.len()
        )));
    }
    if !ring.is_closed() {
        return Err(GeometryError::Invalid("ring is not closed".to_string()));
    }
    for c in &ring.0 {
        if !c.x.is_finite() || !c.y.is_finite() || c.x.abs() > 180.0 || c.y.abs() > 90.0 {
            return Err(GeometryError::Invalid(format!(
                "coordinate ({}, {}) is outside WGS84 lon/lat; reproject to EPSG:4326",
                c.x, c.y
            )));
        }
    }
    check_simple(ring)
}

/// Segments of a ring may only meet their neighbours, and only at the shared
/// vertex. Segments are swept in order of their western end.
fn check_simple(ring: &LineString<f64>) -> Result<(), GeometryError> {
    let mut coords = ring.0.clone();
    coords.dedup();
    let segments: Vec<Line<f64>> = coords.windows(2).map(|w| Line::new(w[0], w[1])).collect();
    let n = segments.len();
    if n < 3 {
        return Err(GeometryError::Invalid("ring is degenerate".to_string()));
    }

    let min_x = |l: &Line<f64>| l.start.x.min(l.end.x);
    let max_x = |l: &Line<f64>| l.start.x.max(l.end.x);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| min_x(&segments[a]).total_cmp(&min_x(&segments[b])));

    for (pos, &i) in order.iter().enumerate() {
        let reach = max_x(&segments[i]);
        for &j in &order[pos + 1..] {
            if min_x(&segments[j]) > reach {
                break;
            }
            let (lo, hi) = (i.min(j), i.max(j));
            let adjacent = hi == lo + 1 || (lo == 0 && hi == n - 1);
            let at = match line_intersection(segments[i], segments[j]) {
                None => continue,
                Some(LineIntersection::SinglePoint { .. }) if adjacent => continue,
                Some(LineIntersection::SinglePoint { intersection, .. }) => intersection,
                Some(LineIntersection::Collinear { intersection }) => intersection.start,
            };
            return Err(GeometryError::Invalid(format!(
                "ring self-intersects near ({}, {})",
                at.x, at.y
            )));
        }
    }
    Ok(())
}

pub fn geometry_type(geom: &Geometry<f64>) -> &'static str {
    match geom {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

/// Bounding box of several geometries.
pub fn bounds<'a>(geoms: impl IntoIterator<Item = &'a Geometry<f64>>) -> Option<Rect<f64>> {
    geoms
        .into_iter()
        .filter_map(|g| g.bounding_rect())
        .reduce(|a, b| {
            Rect::new(
                Coord {
                    x: a.min().x.min(b.min().x),
                    y: a.min().y.min(b.min().y),
                },
                Coord {
                    x: a.max().x.max(b.max().x),
                    y: a.max().y.max(b.max().y),
                },
            )
        })
}

fn position(c: &Coord<f64>) -> Json {
    json!([c.x, c.y])
}

fn line(ls: &LineString<f64>) -> Json {
    Json::Array(ls.0.iter().map(position).collect())
}

fn polygon(p: &Polygon<f64>) -> Json {
    let mut rings = vec![line(p.exterior())];
    rings.extend(p.interiors().iter().map(line));
    Json::Array(rings)
}

/// GeoJSON geometry object for `geom`.
pub fn to_geojson(geom: &Geometry<f64>) -> Json {
    match geom {
        Geometry::Point(p) => json!({ "type": "Point", "coordinates": position(&p.0) }),
        Geometry::Line(l) => json!({
            "type": "LineString",
            "coordinates": [position(&l.start), position(&l.end)],
        }),
        Geometry::LineString(ls) => json!({ "type": "LineString", "coordinates": line(ls) }),
        Geometry::Polygon(p) => json!({ "type": "Polygon", "coordinates": polygon(p) }),
        Geometry::MultiPoint(mp) => json!({
            "type": "MultiPoint",
            "coordinates": mp.0.iter().map(|p| position(&p.0)).collect::<Vec<_>>(),
        }),
        Geometry::MultiLineString(mls) => json!({
            "type": "MultiLineString",
            "coordinates": mls.0.iter().map(line).collect::<Vec<_>>(),
        }),
        Geometry::MultiPolygon(mp) => json!({
            "type": "MultiPolygon",
            "coordinates": mp.0.iter().map(polygon).collect::<Vec<_>>(),
        }),
        Geometry::GeometryCollection(gc) => json!({
            "type": "GeometryCollection",
            "geometries": gc.0.iter().map(to_geojson).collect::<Vec<_>>(),
        }),
        Geometry::Rect(r) => to_geojson(&Geometry::Polygon(r.to_polygon())),
        Geometry::Triangle(t) => to_geojson(&Geometry::Polygon(t.to_polygon())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQUARE: &str = "POLYGON((-9.2 38.7, -9.1 38.7, -9.1 38.8, -9.2 38.8, -9.2 38.7))";

    #[test]
    fn parses_polygon() {
        let geom = parse_region(SQUARE).unwrap();
        assert!(matches!(geom, Geometry::Polygon(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_wkt("POLYGON((oops"),
            Err(GeometryError::WktParse(_))
        ));
    }

    #[test]
    fn rejects_points_as_regions() {
        let err = parse_region("POINT(1 2)").unwrap_err();
        assert!(err.to_string().contains("Point"));
    }

    #[test]
    fn rejects_projected_coordinates() {
        let err = parse_region(
            "POLYGON((-87000 -100000, -86000 -100000, -86000 -99000, -87000 -100000))",
        )
        .unwrap_err();
        assert!(err.to_string().contains("EPSG:4326"));
    }

    #[test]
    fn rejects_self_intersecting_rings() {
        let bowtie = parse_region("POLYGON((0 0, 1 1, 1 0, 0 1, 0 0))").unwrap_err();
        assert!(bowtie.to_string().contains("self-intersects"));

        // Spike folding back along its own edge.
        let spike = parse_region("POLYGON((0 0, 2 0, 1 0, 1 1, 0 0))").unwrap_err();
        assert!(spike.to_string().contains("self-intersects"));

        let flat = parse_region("POLYGON((0 0, 1 0, 0 0, 0 0))").unwrap_err();
        assert!(flat.to_string().contains("degenerate"));

        // Repeated vertices and holes are still fine.
        parse_region(
            "POLYGON((0 0, 4 0, 4 0, 4 4, 0 4, 0 0), (1 1, 2 1, 2 2, 1 2, 1 1))",
        )
        .unwrap();
    }

    #[test]
    fn bounds_cover_all() {
        let a = parse_wkt(SQUARE).unwrap();
        let b = parse_wkt("POLYGON((-8.0 41.0, -7.9 41.0, -7.9 41.1, -8.0 41.0))").unwrap();
        let r = bounds([&a, &b]).unwrap();
        assert_eq!(r.min().x, -9.2);
        assert_eq!(r.max().y, 41.1);
        assert!(bounds(std::iter::empty()).is_none());
    }

    #[test]
    fn geojson_polygon() {
        let g = to_geojson(&parse_wkt(SQUARE).unwrap());
        assert_eq!(g["type"], "Polygon");
        assert_eq!(g["coordinates"][0][0], json!([-9.2, 38.7]));
        assert_eq!(g["coordinates"][0].as_array().unwrap().len(), 5);
    }
}
