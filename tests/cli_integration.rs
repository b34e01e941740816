use std::path::Path;
use std::process::{Command, Output};

// Offline setup: canvas thumbnails, and a geocoder endpoint nothing listens on.
const OFFLINE_CONFIG: &str = r#"
workers: 2
start_points:
  - name: Village Hall
    latitude: 52.4604
    longitude: -2.1637
geocoder:
  endpoint: http://127.0.0.1:9/reverse
  timeout_secs: 1
  min_interval_ms: 0
render:
  engine: canvas
"#;

struct Workspace {
    data_dir: tempfile::TempDir,
    config: tempfile::NamedTempFile,
}

impl Workspace {
    fn new() -> Self {
        let config = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        std::fs::write(config.path(), OFFLINE_CONFIG).unwrap();
        Self {
            data_dir: tempfile::tempdir().unwrap(),
            config,
        }
    }

    fn run(&self, args: &[&str]) -> Output {
        self.run_with_config(self.config.path(), args)
    }

    fn run_with_config(&self, config: &Path, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_gpxroutes"))
            .arg("--config")
            .arg(config)
            .arg("--data-dir")
            .arg(self.data_dir.path())
            .args(args)
            .output()
            .expect("failed to execute process")
    }

    fn show(&self, id: u64) -> serde_json::Value {
        let output = self.run(&["show", &id.to_string()]);
        assert!(output.status.success());
        serde_json::from_slice(&output.stdout).unwrap()
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn upload_creates_and_enriches_route() {
    let ws = Workspace::new();
    let output = ws.run(&["upload", "fixture/sample_track.gpx", "--tags", "Hiking, hills,hiking"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("Route \"Sample Track\" uploaded successfully!"));
    assert!(stdout(&output).contains("Successfully processed route 1"));

    let route = ws.show(1);
    assert_eq!(route["name"], "Sample Track");
    assert_eq!(route["start_location"], "Village Hall");
    assert_eq!(route["tags"], serde_json::json!(["Hiking", "hills"]));
    assert_eq!(route["coordinates"].as_array().unwrap().len(), 3);
    assert!(route["distance_km"].as_f64().unwrap() > 0.2);
    assert!(route["elevation_gain_m"].as_f64().unwrap() > 0.0);
    assert_eq!(route["share_token"].as_str().unwrap().len(), 32);

    let thumbnail = route["thumbnail"].as_str().unwrap();
    assert!(thumbnail.starts_with("thumbnails/") && thumbnail.ends_with(".webp"));
    let bytes = std::fs::read(ws.data_dir.path().join(thumbnail)).unwrap();
    assert_eq!(&bytes[..4], b"RIFF");
    assert!(route["map_html"].as_str().unwrap().starts_with("maps/"));
}

#[test]
fn enrich_is_idempotent() {
    let ws = Workspace::new();
    assert!(ws.run(&["upload", "fixture/sample_track.gpx"]).status.success());
    let before = ws.show(1);

    let output = ws.run(&["enrich"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Successfully processed route 1"));

    let after = ws.show(1);
    assert_eq!(before["thumbnail"], after["thumbnail"]);
    assert_eq!(before["map_html"], after["map_html"]);
    assert_eq!(after["start_location"], "Village Hall");
}

#[test]
fn unreachable_geocoder_falls_back_to_coordinates() {
    let ws = Workspace::new();
    let output = ws.run(&["upload", "fixture/sample_route.gpx", "--name", "Towpath"]);
    assert!(output.status.success());

    let route = ws.show(1);
    assert_eq!(route["name"], "Towpath");
    assert_eq!(route["start_location"], "52.4800, -1.9000");
}

#[test]
fn eager_upload_rejects_malformed_gpx() {
    let ws = Workspace::new();
    let output = ws.run(&["upload", "fixture/malformed.gpx"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("could not be read"));

    let list = ws.run(&["list"]);
    assert!(list.status.success());
    assert!(stdout(&list).trim().is_empty());
}

#[test]
fn bulk_upload_reports_failures_per_file() {
    let ws = Workspace::new();
    let output = ws.run(&[
        "bulk-upload",
        "fixture/sample_track.gpx",
        "fixture/malformed.gpx",
        "fixture/waypoints_only.gpx",
        "--tags",
        "imported",
    ]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("Successfully uploaded 2 route(s)"));
    assert!(text.contains("Error parsing GPX for malformed.gpx"));

    let list = stdout(&ws.run(&["list", "--tag", "imported"]));
    assert_eq!(list.lines().count(), 2);
    assert!(list.contains("Sample Track"));
    assert!(list.contains("waypoints_only"));

    let search = stdout(&ws.run(&["list", "--search", "sample"]));
    assert_eq!(search.lines().count(), 1);
}

#[test]
fn share_token_lookup_and_delete() {
    let ws = Workspace::new();
    assert!(ws.run(&["upload", "fixture/sample_track.gpx"]).status.success());
    let token = ws.show(1)["share_token"].as_str().unwrap().to_string();

    let thumbnail_out = ws.data_dir.path().join("exported.webp");
    let output = ws.run(&["show", "--token", &token, "--thumbnail-out", thumbnail_out.to_str().unwrap()]);
    assert!(output.status.success());
    assert!(Path::new(&thumbnail_out).exists());

    let deleted = ws.run(&["delete", "1"]);
    assert!(stdout(&deleted).contains("Deleted route 1"));
    assert!(!ws.run(&["show", "1"]).status.success());
}

#[test]
fn backfill_commands_support_dry_run() {
    let ws = Workspace::new();
    assert!(ws.run(&["upload", "fixture/sample_track.gpx"]).status.success());

    let output = ws.run(&["regenerate-thumbnails", "--dry-run"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("Would regenerate thumbnail"));
    assert!(text.contains("DRY RUN - No changes were made"));

    let output = ws.run(&["update-start-locations", "--all", "--dry-run"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Unchanged: 1"));

    let before = ws.show(1)["thumbnail"].clone();
    let output = ws.run(&["regenerate-thumbnails", "--route-id", "1"]);
    assert!(stdout(&output).contains("Thumbnail regenerated successfully"));
    assert_ne!(ws.show(1)["thumbnail"], before);
}

#[test]
fn start_point_match_replaces_geocoded_location() {
    let ws = Workspace::new();
    assert!(ws.run(&["upload", "fixture/sample_route.gpx"]).status.success());
    assert_eq!(ws.show(1)["start_location"], "52.4800, -1.9000");

    let with_basin = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
    let config = OFFLINE_CONFIG.replace(
        "start_points:\n",
        "start_points:\n  - name: Canal Basin\n    latitude: 52.4801\n    longitude: -1.9001\n",
    );
    std::fs::write(with_basin.path(), config).unwrap();

    let output = ws.run_with_config(with_basin.path(), &["update-start-locations", "--all"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("[OK] Route #1 'Canal Ride': '52.4800, -1.9000' -> 'Canal Basin' (start point)"));
    assert!(text.contains("Matched to start points: 1"));
    assert_eq!(ws.show(1)["start_location"], "Canal Basin");
}

#[test]
fn force_geocode_keeps_location_when_geocoder_is_down() {
    let ws = Workspace::new();
    assert!(ws.run(&["upload", "fixture/sample_route.gpx"]).status.success());

    let output = ws.run(&["update-start-locations", "--all", "--force-geocode"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("Re-geocoded: 0"));
    assert!(text.contains("Unchanged: 1"));
    assert_eq!(ws.show(1)["start_location"], "52.4800, -1.9000");
}
