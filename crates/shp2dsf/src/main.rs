use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
    process::Command,
};

// Shapefile geometry + DBF attributes
use shapefile::dbase::FieldValue;
use shapefile::Shape;

// DSF tile grid, text plans + NZTM inverse
use dsftxt::{nztm, DsfPlan, Placement, TileId};

/// Scenery folder DSF tiles live under, per the simulator's layout.
const EARTH_NAV_DATA: &str = "Earth nav data";

/// How to interpret incoming point coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum InputCrs {
    /// Try to decide automatically from ranges.
    Auto,
    /// Points are `[lon_deg, lat_deg]` (WGS-84 / NZGD2000 degrees).
    LonLat,
    /// Points are NZTM2000 `[easting_m, northing_m]`.
    Nztm,
}

impl std::fmt::Display for InputCrs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InputCrs::Auto => "auto",
            InputCrs::LonLat => "lonlat",
            InputCrs::Nztm => "nztm",
        };

        f.write_str(s)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "shp2dsf", version)]
struct Args {
    /// Input ESRI Shapefile (.shp) of hut point features.
    shapefile: PathBuf,

    /// Scenery package root; tiles land under `<output-dir>/Earth nav data/`.
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Path to the DSFTool binary used to compile text plans.
    #[arg(long, default_value = "DSFTool")]
    dsftool: PathBuf,

    /// Either auto-detect or force the input coordinate system.
    #[arg(long, value_enum, default_value_t = InputCrs::Auto)]
    input_crs: InputCrs,

    /// Optional JSON file (`{"category": "path.obj", ...}`) replacing the
    /// built-in category -> object table.
    #[arg(long)]
    object_map: Option<PathBuf>,

    /// Value written as the `sim/author` property of every tile.
    #[arg(long, default_value = "shp2dsf")]
    author: String,

    /// True heading in degrees applied to every placed object.
    #[arg(long, default_value_t = 0.0)]
    rotation: f64,

    /// DBF attribute holding the hut name.
    #[arg(long, default_value = "name")]
    name_field: String,

    /// DBF attribute holding the hut category used for object mapping.
    #[arg(long, default_value = "objtype")]
    category_field: String,

    /// DBF attribute holding the facility status.
    #[arg(long, default_value = "status")]
    status_field: String,

    #[arg(long, default_value_t = false)]
    overwrite: bool,

    /// Keep the intermediate `.dsf.txt` plans next to the compiled tiles.
    #[arg(long, default_value_t = false)]
    keep_text: bool,

    /// Write text plans only; do not invoke DSFTool.
    #[arg(long, default_value_t = false)]
    no_compile: bool,
}

/// One placeable hut, reprojected and mapped to its scenery asset.
#[derive(Debug, Clone)]
struct Hut {
    name: String,
    object_path: String,
    lon: f64,
    lat: f64,
}

#[derive(Debug, Default)]
struct ReadStats {
    read: usize,
    placed: usize,
    skipped_geometry: usize,
    skipped_unmapped: usize,
}

/// Built-in mapping from the source dataset's hut categories to
/// OpenSceneryX building assets.
fn default_object_map() -> BTreeMap<String, String> {
    [
        (
            "Serviced Hut",
            "opensceneryx/objects/buildings/residential/houses/wooden/3.obj",
        ),
        (
            "Standard Hut",
            "opensceneryx/objects/buildings/residential/huts/wooden/7.obj",
        ),
        (
            "Basic Hut/bivvy",
            "opensceneryx/objects/buildings/residential/huts/wooden/1.obj",
        ),
        (
            "Serviced-Alpine Hut",
            "opensceneryx/objects/buildings/residential/houses/wooden/5.obj",
        ),
        (
            "Great Walk Hut",
            "opensceneryx/objects/buildings/residential/houses/brick/1.obj",
        ),
    ]
    .into_iter()
    .map(|(category, path)| (category.to_owned(), path.to_owned()))
    .collect()
}

/// Load a category -> object path table from JSON, replacing the defaults
/// wholesale.
fn load_object_map(path: &Path) -> Result<BTreeMap<String, String>> {
    let file =
        File::open(path).with_context(|| format!("opening object map {}", path.display()))?;
    let map: BTreeMap<String, String> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing object map {}", path.display()))?;

    if map.is_empty() {
        bail!("object map {} maps no categories", path.display());
    }

    Ok(map)
}

/// Lower-cased attribute map for one DBF record, so field lookups are
/// case-insensitive.
fn record_fields(record: shapefile::dbase::Record) -> HashMap<String, FieldValue> {
    record
        .into_iter()
        .map(|(field_name, value)| (field_name.to_ascii_lowercase(), value))
        .collect()
}

fn field_str(fields: &HashMap<String, FieldValue>, field_name: &str) -> Option<String> {
    let value = fields.get(&field_name.to_ascii_lowercase())?;

    let text = match value {
        FieldValue::Character(Some(s)) => s.trim(),
        FieldValue::Memo(s) => s.trim(),
        _ => return None,
    };

    if text.is_empty() {
        None
    } else {
        Some(text.to_owned())
    }
}

/// X/Y of a point record; huts are point features, anything else is skipped.
fn point_of_shape(shape: &Shape) -> Option<(f64, f64)> {
    match shape {
        Shape::Point(p) => Some((p.x, p.y)),
        Shape::PointM(p) => Some((p.x, p.y)),
        Shape::PointZ(p) => Some((p.x, p.y)),
        _ => None,
    }
}

/// Heuristic to decide how point coordinates should be interpreted.
fn detect_input_crs(sample: &[(f64, f64)]) -> InputCrs {
    let total = sample.len().max(1) as f64;

    // Degree-valued pairs fit in the lon/lat envelope; NZTM coordinates are
    // seven-digit meter values.
    let deg_like = sample
        .iter()
        .filter(|(x, y)| x.abs() <= 180.0 && y.abs() <= 90.0)
        .count();

    if (deg_like as f64) / total >= 0.90 {
        InputCrs::LonLat
    } else {
        InputCrs::Nztm
    }
}

fn read_huts(args: &Args, object_map: &BTreeMap<String, String>) -> Result<(Vec<Hut>, ReadStats)> {
    let mut reader = shapefile::Reader::from_path(&args.shapefile)
        .with_context(|| format!("opening {}", args.shapefile.display()))?;

    struct RawHut {
        name: String,
        category: Option<String>,
        x: f64,
        y: f64,
    }

    let mut raw = Vec::new();
    let mut stats = ReadStats::default();

    // --------------------------------------------------------------------
    // Pass 1: pull point geometry and attributes out of the shapefile.
    // --------------------------------------------------------------------
    for (index, result) in reader.iter_shapes_and_records().enumerate() {
        let (shape, record) = result.with_context(|| format!("reading record {}", index))?;
        stats.read += 1;

        let fields = record_fields(record);
        let name = field_str(&fields, &args.name_field).unwrap_or_else(|| "(unnamed)".to_owned());

        let Some((x, y)) = point_of_shape(&shape) else {
            warn!("record {} ({}): not a point feature ({}), skipped", index, name, shape);
            stats.skipped_geometry += 1;
            continue;
        };

        if !x.is_finite() || !y.is_finite() {
            warn!("record {} ({}): non-finite coordinates, skipped", index, name);
            stats.skipped_geometry += 1;
            continue;
        }

        if let Some(status) = field_str(&fields, &args.status_field) {
            debug!("record {}: {} (status {})", index, name, status);
        }

        raw.push(RawHut {
            name,
            category: field_str(&fields, &args.category_field),
            x,
            y,
        });
    }

    // --------------------------------------------------------------------
    // Decide the coordinate system once, over the whole file.
    // --------------------------------------------------------------------
    let crs = match args.input_crs {
        InputCrs::Auto => {
            let sample: Vec<(f64, f64)> = raw.iter().take(4096).map(|h| (h.x, h.y)).collect();
            let guess = detect_input_crs(&sample);

            info!("Input CRS (auto-detected): {}", guess);
            guess
        }
        forced => {
            info!("Input CRS (forced): {}", forced);
            forced
        }
    };

    // --------------------------------------------------------------------
    // Pass 2: map categories to assets and reproject into degrees.
    // --------------------------------------------------------------------
    let mut huts = Vec::with_capacity(raw.len());

    for hut in raw {
        let Some(category) = hut.category else {
            warn!("{}: no category attribute, skipped", hut.name);
            stats.skipped_unmapped += 1;
            continue;
        };

        let Some(object_path) = object_map.get(&category) else {
            warn!("{}: no object mapping for category '{}', skipped", hut.name, category);
            stats.skipped_unmapped += 1;
            continue;
        };

        let (lon, lat) = match crs {
            InputCrs::Nztm => nztm::to_lonlat(hut.x, hut.y),
            _ => (hut.x, hut.y),
        };

        huts.push(Hut {
            name: hut.name,
            object_path: object_path.clone(),
            lon,
            lat,
        });
    }

    stats.placed = huts.len();
    Ok((huts, stats))
}

/// Group huts by the 1°x1° tile their position buckets into.
fn bucket_by_tile(huts: Vec<Hut>) -> BTreeMap<TileId, Vec<Hut>> {
    let mut tiles: BTreeMap<TileId, Vec<Hut>> = BTreeMap::new();

    for hut in huts {
        tiles
            .entry(TileId::from_lon_lat(hut.lon, hut.lat))
            .or_default()
            .push(hut);
    }

    tiles
}

/// Fail fast when the DSFTool binary cannot be spawned at all.
fn probe_dsftool(dsftool: &Path) -> Result<()> {
    Command::new(dsftool).arg("--help").output().with_context(|| {
        format!(
            "'{}' is not runnable; pass --dsftool or put DSFTool on PATH",
            dsftool.display()
        )
    })?;

    Ok(())
}

fn process_one_tile(tile: TileId, huts: &[Hut], args: &Args) -> Result<()> {
    let folder = args
        .output_dir
        .join(EARTH_NAV_DATA)
        .join(tile.folder_name());
    fs::create_dir_all(&folder).with_context(|| format!("creating {}", folder.display()))?;

    let dsf_path = folder.join(format!("{}.dsf", tile));
    let txt_path = folder.join(format!("{}.dsf.txt", tile));

    if dsf_path.exists() && !args.overwrite {
        debug!("Skipping existing tile: {}", dsf_path.display());
        return Ok(());
    }

    // ---------------------------------------------------------------------
    // Render the text plan for this tile.
    // ---------------------------------------------------------------------
    let mut plan = DsfPlan::new(tile);
    plan.push_property("sim/author", &args.author);
    plan.push_property(
        "sim/creation_agent",
        concat!("shp2dsf ", env!("CARGO_PKG_VERSION")),
    );

    for hut in huts {
        debug!("{}: {} -> {}", tile, hut.name, hut.object_path);
        plan.add_object(
            &hut.object_path,
            Placement {
                lon: hut.lon,
                lat: hut.lat,
                heading_deg: args.rotation,
            },
        )?;
    }

    dsftxt::write_file(&txt_path, &plan)
        .with_context(|| format!("writing {}", txt_path.display()))?;

    if args.no_compile {
        info!(
            "Planned {} ({} huts, {} object types)",
            txt_path.display(),
            plan.placement_count(),
            plan.object_count()
        );
        return Ok(());
    }

    // ---------------------------------------------------------------------
    // Compile with DSFTool.
    // ---------------------------------------------------------------------
    let output = Command::new(&args.dsftool)
        .arg("--text2dsf")
        .arg(&txt_path)
        .arg(&dsf_path)
        .output()
        .with_context(|| format!("spawning {}", args.dsftool.display()))?;

    if !output.status.success() {
        // DSFTool can leave partial output behind on failure.
        let _ = fs::remove_file(&dsf_path);

        bail!(
            "DSFTool failed on {} ({}): {}",
            txt_path.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    if !args.keep_text {
        fs::remove_file(&txt_path)
            .with_context(|| format!("removing {}", txt_path.display()))?;
    }

    info!(
        "OK {} ({} huts, {} object types)",
        dsf_path.display(),
        plan.placement_count(),
        plan.object_count()
    );

    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();

    let object_map = match &args.object_map {
        Some(path) => load_object_map(path)?,
        None => default_object_map(),
    };

    // Probe the external tool before doing any tile work.
    if !args.no_compile {
        probe_dsftool(&args.dsftool)?;
    }

    let (huts, stats) = read_huts(&args, &object_map)?;
    if huts.is_empty() {
        bail!("no placeable huts found in {}", args.shapefile.display());
    }

    let tiles = bucket_by_tile(huts);
    info!("{} huts across {} tiles", stats.placed, tiles.len());

    fs::create_dir_all(args.output_dir.join(EARTH_NAV_DATA))
        .with_context(|| format!("creating output under {}", args.output_dir.display()))?;

    // Compile tiles in parallel; DSFTool is the slow step.
    let failed: usize = tiles
        .par_iter()
        .map(|(tile, huts)| match process_one_tile(*tile, huts, &args) {
            Ok(()) => 0,
            Err(err) => {
                warn!("Error processing tile {}: {:#}", tile, err);
                1
            }
        })
        .sum();

    info!(
        "Done: {} records read, {} placed, {} skipped (geometry), {} skipped (unmapped), {} tiles, {} failed",
        stats.read,
        stats.placed,
        stats.skipped_geometry,
        stats.skipped_unmapped,
        tiles.len(),
        failed
    );

    if failed > 0 {
        bail!("{} of {} tiles failed to compile", failed, tiles.len());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map_covers_source_categories() {
        let map = default_object_map();

        assert_eq!(map.len(), 5);
        for category in [
            "Serviced Hut",
            "Standard Hut",
            "Basic Hut/bivvy",
            "Serviced-Alpine Hut",
            "Great Walk Hut",
        ] {
            let path = map.get(category).unwrap_or_else(|| panic!("missing {category}"));
            assert!(path.ends_with(".obj"), "{category} -> {path}");
        }
    }

    #[test]
    fn object_map_json_parses_as_flat_table() {
        let json = r#"{"Standard Hut": "lib/custom/hut.obj", "Bivvy": "lib/custom/bivvy.obj"}"#;
        let map: BTreeMap<String, String> = serde_json::from_str(json).unwrap();

        assert_eq!(map.len(), 2);
        assert_eq!(map["Standard Hut"], "lib/custom/hut.obj");
    }

    #[test]
    fn detects_degree_coordinates() {
        let sample = [(174.77, -41.29), (172.64, -43.53), (167.70, -45.40)];
        assert_eq!(detect_input_crs(&sample), InputCrs::LonLat);
    }

    #[test]
    fn detects_nztm_meters() {
        let sample = [
            (1_748_700.0, 5_427_900.0),
            (1_570_600.0, 5_180_000.0),
            (2_010_000.0, 5_700_000.0),
        ];
        assert_eq!(detect_input_crs(&sample), InputCrs::Nztm);
    }

    #[test]
    fn empty_sample_defaults_to_degrees() {
        assert_eq!(detect_input_crs(&[]), InputCrs::LonLat);
    }

    #[test]
    fn bucketing_splits_on_tile_boundaries() {
        let hut = |lon: f64, lat: f64| Hut {
            name: "hut".to_owned(),
            object_path: "lib/hut.obj".to_owned(),
            lon,
            lat,
        };

        let tiles = bucket_by_tile(vec![
            hut(174.2, -41.2),
            hut(174.8, -41.9),
            hut(175.0, -41.5), // exactly on the eastern boundary: next tile over
        ]);

        assert_eq!(tiles.len(), 2);
        assert_eq!(tiles[&TileId::from_lon_lat(174.5, -41.5)].len(), 2);
        assert_eq!(tiles[&TileId::from_lon_lat(175.0, -41.5)].len(), 1);
    }
}
