//! DSFTXT: text plans for X-Plane DSF overlay tiles, as consumed by
//! `DSFTool --text2dsf`.
//!
//! - One plan per 1°x1° tile, named by the latitude/longitude of its
//!   southwest corner.
//! - Tiles live in 10°x10° folders, also named by their southwest corner.
//! - Names are sign-prefixed and zero-padded: latitude to 2 digits,
//!   longitude to 3 (`-42+174.dsf` inside `-50+170/`).
//!
//! Plan layout (text, one record per line, `\n` terminated):
//!   A                        (line ending convention marker)
//!   800                      (format version)
//!   DSFTool                  (target tool)
//!   PROPERTY <key> <value>   (tile extent first, then flags, then credits)
//!   OBJECT_DEF <virtual path of a .obj asset>
//!   OBJECT <def-index> <lon> <lat> <heading-deg>
//!
//! Object definitions are emitted in sorted order and placements reference
//! them by index, so a plan renders identically from run to run.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Southwest corner of a 1°x1° DSF tile, in whole degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TileId {
    lat: i32,
    lon: i32,
}

impl TileId {
    /// Tile containing the given WGS-84 position.
    ///
    /// Longitude is wrapped into [-180, 180) first so +180 lands on the
    /// western alias of the antimeridian tile; latitude rows are clamped to
    /// the valid [-90, 89] range.
    pub fn from_lon_lat(lon_deg: f64, lat_deg: f64) -> Self {
        let lon = wrap_lon(lon_deg);
        Self {
            lat: (lat_deg.floor() as i32).clamp(-90, 89),
            lon: lon.floor() as i32,
        }
    }

    pub fn lat(&self) -> i32 {
        self.lat
    }

    pub fn lon(&self) -> i32 {
        self.lon
    }

    /// Tile extent, in whole degrees.
    pub fn south(&self) -> i32 {
        self.lat
    }

    pub fn north(&self) -> i32 {
        self.lat + 1
    }

    pub fn west(&self) -> i32 {
        self.lon
    }

    pub fn east(&self) -> i32 {
        self.lon + 1
    }

    /// Southwest corner of the enclosing 10°x10° folder.
    pub fn folder(&self) -> (i32, i32) {
        (self.lat.div_euclid(10) * 10, self.lon.div_euclid(10) * 10)
    }

    /// Name of the enclosing 10°x10° folder, e.g. `-50+170`.
    pub fn folder_name(&self) -> String {
        let (lat, lon) = self.folder();
        format!("{:+03}{:+04}", lat, lon)
    }

    /// Tile file stem, e.g. `-42+174`.
    pub fn file_stem(&self) -> String {
        format!("{:+03}{:+04}", self.lat, self.lon)
    }

    /// Path of the compiled tile relative to the `Earth nav data` root,
    /// e.g. `-50+170/-42+174.dsf`.
    pub fn relative_dsf_path(&self) -> PathBuf {
        Path::new(&self.folder_name()).join(format!("{}.dsf", self.file_stem()))
    }

    /// Whether a position buckets into this tile.
    pub fn contains(&self, lon_deg: f64, lat_deg: f64) -> bool {
        Self::from_lon_lat(lon_deg, lat_deg) == *self
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}

/// Wrap a longitude into [-180, 180).
#[inline]
pub fn wrap_lon(lon_deg: f64) -> f64 {
    let wrapped = lon_deg.rem_euclid(360.0);
    if wrapped >= 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

/// One placed scenery object inside a tile.
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    /// WGS-84 longitude, degrees.
    pub lon: f64,
    /// WGS-84 latitude, degrees.
    pub lat: f64,
    /// True heading, degrees clockwise from north.
    pub heading_deg: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("placement at ({lon}, {lat}) is outside tile {tile}")]
    OutsideTile { tile: TileId, lon: f64, lat: f64 },
}

/// One tile's worth of overlay scenery: properties, object definitions and
/// placements, renderable as DSFTool text.
#[derive(Debug, Clone)]
pub struct DsfPlan {
    tile: TileId,
    properties: Vec<(String, String)>,
    objects: BTreeMap<String, Vec<Placement>>,
}

impl DsfPlan {
    /// Create an empty overlay plan for a tile, seeded with the extent and
    /// flag properties DSFTool requires.
    pub fn new(tile: TileId) -> Self {
        let properties = vec![
            ("sim/north".to_owned(), tile.north().to_string()),
            ("sim/south".to_owned(), tile.south().to_string()),
            ("sim/east".to_owned(), tile.east().to_string()),
            ("sim/west".to_owned(), tile.west().to_string()),
            ("sim/planet".to_owned(), "earth".to_owned()),
            ("sim/require_object".to_owned(), "1/0".to_owned()),
            ("sim/overlay".to_owned(), "1".to_owned()),
        ];

        Self {
            tile,
            properties,
            objects: BTreeMap::new(),
        }
    }

    pub fn tile(&self) -> TileId {
        self.tile
    }

    /// Append a property record after the seeded ones (credits, etc.).
    pub fn push_property(&mut self, key: &str, value: &str) {
        self.properties.push((key.to_owned(), value.to_owned()));
    }

    /// Add a placement of the given object asset.
    ///
    /// The position must bucket into this plan's tile; the plan assigns the
    /// definition index itself, so indices cannot dangle.
    pub fn add_object(&mut self, object_path: &str, placement: Placement) -> Result<(), PlanError> {
        if !self.tile.contains(placement.lon, placement.lat) {
            return Err(PlanError::OutsideTile {
                tile: self.tile,
                lon: placement.lon,
                lat: placement.lat,
            });
        }

        self.objects
            .entry(object_path.to_owned())
            .or_default()
            .push(placement);

        Ok(())
    }

    /// Number of distinct object definitions.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Number of placements across all definitions.
    pub fn placement_count(&self) -> usize {
        self.objects.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Render the plan in the DSFTool text format.
    pub fn to_text(&self) -> String {
        let mut out = String::new();

        // Header
        out.push_str("A\n800\nDSFTool\n");

        for (key, value) in &self.properties {
            out.push_str(&format!("PROPERTY {} {}\n", key, value));
        }

        // Definitions first, then placements referencing them by index.
        // BTreeMap iteration order makes both deterministic.
        for path in self.objects.keys() {
            out.push_str(&format!("OBJECT_DEF {}\n", path));
        }

        for (index, placements) in self.objects.values().enumerate() {
            for p in placements {
                out.push_str(&format!(
                    "OBJECT {} {:.7} {:.7} {:.1}\n",
                    index, p.lon, p.lat, p.heading_deg
                ));
            }
        }

        out
    }
}

/// Write a plan to disk as DSFTool text.
pub fn write_file<P: AsRef<Path>>(path: P, plan: &DsfPlan) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(plan.to_text().as_bytes())?;
    file.flush()
}

pub mod nztm {
    //! NZTM2000 (EPSG:2193) <-> longitude/latitude degrees.
    //!
    //! Transverse Mercator on the GRS80 ellipsoid with the LINZ projection
    //! parameters; series expansions good to well under a meter over the
    //! NZTM domain.

    /// Semi-major axis (equatorial radius) of GRS80, meters.
    pub const A: f64 = 6_378_137.0;

    /// GRS80 flattening factor (1 / 298.257222101).
    pub const F: f64 = 1.0 / 298.257_222_101;

    /// First eccentricity squared.
    pub const E2: f64 = F * (2.0 - F);

    /// Central meridian, degrees east.
    pub const LON0_DEG: f64 = 173.0;

    /// Central meridian scale factor.
    pub const K0: f64 = 0.9996;

    /// False easting, meters.
    pub const FALSE_EASTING: f64 = 1_600_000.0;

    /// False northing, meters.
    pub const FALSE_NORTHING: f64 = 10_000_000.0;

    /// Meridian arc length from the equator to `lat_rad`, meters.
    #[inline]
    fn meridian_arc(lat_rad: f64) -> f64 {
        let e4 = E2 * E2;
        let e6 = e4 * E2;

        A * ((1.0 - E2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * lat_rad
            - (3.0 * E2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * lat_rad).sin()
            + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * lat_rad).sin()
            - (35.0 * e6 / 3072.0) * (6.0 * lat_rad).sin())
    }

    /// Project longitude/latitude degrees to NZTM easting/northing meters.
    pub fn from_lonlat(lon_deg: f64, lat_deg: f64) -> (f64, f64) {
        let lat = lat_deg.to_radians();
        let dlon = (lon_deg - LON0_DEG).to_radians();
        let (sin_lat, cos_lat) = lat.sin_cos();

        let ep2 = E2 / (1.0 - E2);
        let n = A / (1.0 - E2 * sin_lat * sin_lat).sqrt();
        let t = lat.tan() * lat.tan();
        let c = ep2 * cos_lat * cos_lat;
        let a = dlon * cos_lat;

        let easting = FALSE_EASTING
            + K0 * n
                * (a + (1.0 - t + c) * a.powi(3) / 6.0
                    + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * ep2) * a.powi(5) / 120.0);

        // The projection's latitude of origin is the equator, so the arc from
        // the equator is the whole meridian term.
        let northing = FALSE_NORTHING
            + K0 * (meridian_arc(lat)
                + n * lat.tan()
                    * (a * a / 2.0
                        + (5.0 - t + 9.0 * c + 4.0 * c * c) * a.powi(4) / 24.0
                        + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * ep2) * a.powi(6)
                            / 720.0));

        (easting, northing)
    }

    /// Inverse: NZTM easting/northing meters to (longitude, latitude) degrees.
    pub fn to_lonlat(easting: f64, northing: f64) -> (f64, f64) {
        let e4 = E2 * E2;
        let e6 = e4 * E2;
        let ep2 = E2 / (1.0 - E2);

        // Footpoint latitude from the rectifying latitude.
        let m = (northing - FALSE_NORTHING) / K0;
        let mu = m / (A * (1.0 - E2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0));
        let e1 = (1.0 - (1.0 - E2).sqrt()) / (1.0 + (1.0 - E2).sqrt());

        let phi1 = mu
            + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
            + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
            + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
            + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

        let (sin1, cos1) = phi1.sin_cos();
        let n1 = A / (1.0 - E2 * sin1 * sin1).sqrt();
        let r1 = A * (1.0 - E2) / (1.0 - E2 * sin1 * sin1).powf(1.5);
        let t1 = phi1.tan() * phi1.tan();
        let c1 = ep2 * cos1 * cos1;
        let d = (easting - FALSE_EASTING) / (n1 * K0);

        let lat = phi1
            - (n1 * phi1.tan() / r1)
                * (d * d / 2.0
                    - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * ep2) * d.powi(4) / 24.0
                    + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1
                        - 252.0 * ep2
                        - 3.0 * c1 * c1)
                        * d.powi(6)
                        / 720.0);

        let lon = LON0_DEG.to_radians()
            + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
                + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * ep2 + 24.0 * t1 * t1)
                    * d.powi(5)
                    / 120.0)
                / cos1;

        (lon.to_degrees(), lat.to_degrees())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_floors_toward_southwest() {
        // Wellington: the tile corner is south and west of the position.
        let tile = TileId::from_lon_lat(174.7772, -41.2889);
        assert_eq!((tile.lat(), tile.lon()), (-42, 174));
        assert_eq!(tile.file_stem(), "-42+174");
        assert_eq!(tile.folder_name(), "-50+170");
    }

    #[test]
    fn tile_names_in_all_quadrants() {
        let cases = [
            ((174.77, -41.29), "-42+174", "-50+170"),
            ((-122.31, 37.62), "+37-123", "+30-130"),
            ((-58.45, -34.61), "-35-059", "-40-060"),
            ((5.5, 5.5), "+05+005", "+00+000"),
        ];

        for ((lon, lat), stem, folder) in cases {
            let tile = TileId::from_lon_lat(lon, lat);
            assert_eq!(tile.file_stem(), stem, "stem for ({lon}, {lat})");
            assert_eq!(tile.folder_name(), folder, "folder for ({lon}, {lat})");
        }
    }

    #[test]
    fn tile_boundary_belongs_to_its_own_corner() {
        let tile = TileId::from_lon_lat(174.0, -41.0);
        assert_eq!((tile.lat(), tile.lon()), (-41, 174));
        assert!(tile.contains(174.0, -41.0));
        assert!(tile.contains(174.9999, -40.0001));
        assert!(!tile.contains(175.0, -40.5));
        assert!(!tile.contains(174.5, -40.0));
    }

    #[test]
    fn antimeridian_wraps_west() {
        assert_eq!(wrap_lon(180.0), -180.0);
        assert_eq!(wrap_lon(-180.0), -180.0);
        assert_eq!(wrap_lon(181.5), -178.5);
        assert_eq!(wrap_lon(-541.0), 179.0);

        let east_side = TileId::from_lon_lat(179.9, -44.5);
        assert_eq!(east_side.file_stem(), "-45+179");

        let wrapped = TileId::from_lon_lat(180.1, -44.5);
        assert_eq!(wrapped.file_stem(), "-45-180");
        assert_eq!(wrapped, TileId::from_lon_lat(-179.9, -44.5));
    }

    #[test]
    fn relative_path_nests_tile_in_folder() {
        let tile = TileId::from_lon_lat(173.2, -36.5);
        assert_eq!(
            tile.relative_dsf_path(),
            PathBuf::from("-40+170").join("-37+173.dsf")
        );
    }

    #[test]
    fn plan_renders_deterministic_text() {
        let tile = TileId::from_lon_lat(174.5, -41.5);
        let mut plan = DsfPlan::new(tile);
        plan.push_property("sim/author", "test");

        // Insert out of sorted order; definitions must come out sorted.
        plan.add_object(
            "lib/b.obj",
            Placement {
                lon: 174.25,
                lat: -41.75,
                heading_deg: 0.0,
            },
        )
        .unwrap();
        plan.add_object(
            "lib/a.obj",
            Placement {
                lon: 174.5,
                lat: -41.5,
                heading_deg: 90.0,
            },
        )
        .unwrap();

        let expected = "\
A
800
DSFTool
PROPERTY sim/north -41
PROPERTY sim/south -42
PROPERTY sim/east 175
PROPERTY sim/west 174
PROPERTY sim/planet earth
PROPERTY sim/require_object 1/0
PROPERTY sim/overlay 1
PROPERTY sim/author test
OBJECT_DEF lib/a.obj
OBJECT_DEF lib/b.obj
OBJECT 0 174.5000000 -41.5000000 90.0
OBJECT 1 174.2500000 -41.7500000 0.0
";
        assert_eq!(plan.to_text(), expected);
        assert_eq!(plan.object_count(), 2);
        assert_eq!(plan.placement_count(), 2);
    }

    #[test]
    fn plan_rejects_placement_outside_tile() {
        let mut plan = DsfPlan::new(TileId::from_lon_lat(174.5, -41.5));
        let err = plan
            .add_object(
                "lib/a.obj",
                Placement {
                    lon: 175.5,
                    lat: -41.5,
                    heading_deg: 0.0,
                },
            )
            .unwrap_err();

        assert!(matches!(err, PlanError::OutsideTile { .. }));
        assert!(plan.is_empty());
    }

    #[test]
    fn nztm_origin_maps_to_central_meridian() {
        let (lon, lat) = nztm::to_lonlat(nztm::FALSE_EASTING, nztm::FALSE_NORTHING);
        assert!((lon - nztm::LON0_DEG).abs() < 1e-9, "lon = {lon}");
        assert!(lat.abs() < 1e-9, "lat = {lat}");
    }

    #[test]
    fn nztm_round_trips_over_new_zealand() {
        // Wellington, Christchurch, Fiordland, East Cape.
        let points = [
            (174.7772, -41.2889),
            (172.6362, -43.5321),
            (167.7000, -45.4000),
            (178.0000, -38.6000),
        ];

        for (lon, lat) in points {
            let (e, n) = nztm::from_lonlat(lon, lat);
            let (lon2, lat2) = nztm::to_lonlat(e, n);
            assert!((lon - lon2).abs() < 1e-7, "lon {lon} -> {lon2}");
            assert!((lat - lat2).abs() < 1e-7, "lat {lat} -> {lat2}");
        }
    }

    #[test]
    fn nztm_auckland_lands_in_expected_range() {
        // Coarse sanity against the published grid: Auckland sits around
        // E 1.757M, N 5.920M.
        let (e, n) = nztm::from_lonlat(174.762, -36.848);
        assert!((1_750_000.0..1_765_000.0).contains(&e), "easting = {e}");
        assert!((5_915_000.0..5_930_000.0).contains(&n), "northing = {n}");
    }
}
