use anyhow::{Context, Result, bail};
use image::DynamicImage;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use super::RenderEngine;
use super::html::thumbnail_page;
use crate::config::RenderConfig;
use crate::parser::LatLon;

const CANDIDATES: [&str; 4] = ["chromium", "chromium-browser", "google-chrome", "google-chrome-stable"];
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Loads a Leaflet page in a headless Chromium and screenshots it.
///
/// One browser process per call; the page gets `tile_wait` of virtual time
/// to fetch basemap tiles before the capture.
pub struct BrowserEngine {
    executable: PathBuf,
    tile_wait: Duration,
    /// Wall-clock limit for one browser process.
    deadline: Duration,
    min_image_bytes: usize,
    tile_url: String,
}

impl BrowserEngine {
    pub fn new(executable: PathBuf, config: &RenderConfig) -> Self {
        Self {
            executable,
            tile_wait: Duration::from_millis(config.tile_wait_ms),
            deadline: Duration::from_millis(config.tile_wait_ms.saturating_add(config.browser_grace_ms)),
            min_image_bytes: config.min_image_bytes,
            tile_url: config.tile_url.clone(),
        }
    }

    /// Configured `browser_path`, else the first known browser binary on `PATH`.
    pub fn locate(config: &RenderConfig) -> Option<Self> {
        let executable = match &config.browser_path {
            Some(path) if path.is_file() => Some(path.clone()),
            Some(path) => {
                tracing::warn!("Render: browser_path {:?} does not exist", path);
                None
            }
            None => find_on_path(&CANDIDATES),
        }?;
        Some(Self::new(executable, config))
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

fn find_on_path(names: &[&str]) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
        .find(|candidate| candidate.is_file())
}

impl RenderEngine for BrowserEngine {
    fn name(&self) -> &'static str {
        "browser"
    }

    fn render(&self, points: &[LatLon], width: u32, height: u32) -> Result<DynamicImage> {
        let page = thumbnail_page(points, width, height, &self.tile_url)
            .context("Render: No points to draw")?;

        let mut page_file = tempfile::Builder::new()
            .prefix("route-")
            .suffix(".html")
            .tempfile()
            .context("Render: Failed to create map page")?;
        page_file.write_all(page.as_bytes())?;
        page_file.flush()?;

        let shot_dir = tempfile::tempdir().context("Render: Failed to create screenshot dir")?;
        let shot_path = shot_dir.path().join("screenshot.png");

        let mut child = Command::new(&self.executable)
            .arg("--headless")
            .arg("--disable-gpu")
            .arg("--hide-scrollbars")
            .arg(format!("--window-size={width},{height}"))
            .arg(format!("--virtual-time-budget={}", self.tile_wait.as_millis()))
            .arg(format!("--screenshot={}", shot_path.display()))
            .arg(format!("file://{}", page_file.path().display()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Render: Failed to launch {:?}", self.executable))?;

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().context("Render: Lost track of browser")? {
                break status;
            }
            if started.elapsed() >= self.deadline {
                let _ = child.kill();
                let _ = child.wait();
                bail!("Render: Browser timed out after {:?}", self.deadline);
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            bail!("Render: Browser exited with {}", status);
        }

        let bytes = std::fs::read(&shot_path).context("Render: Browser wrote no screenshot")?;
        if bytes.len() < self.min_image_bytes {
            bail!(
                "Render: Screenshot too small ({} bytes), tiles did not load",
                bytes.len()
            );
        }

        image::load_from_memory(&bytes).context("Render: Unreadable screenshot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_browser_path_is_unavailable() {
        let config = RenderConfig {
            browser_path: Some(PathBuf::from("/nonexistent/chromium")),
            ..RenderConfig::default()
        };
        assert!(BrowserEngine::locate(&config).is_none());
    }

    #[test]
    fn failing_browser_is_an_error() {
        // `false` exits non-zero without writing a screenshot.
        let Some(executable) = find_on_path(&["false"]) else {
            return;
        };
        let engine = BrowserEngine::new(executable, &RenderConfig::default());
        let result = engine.render(&[(52.0, -2.0), (52.1, -2.1)], 200, 100);
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn hung_browser_is_killed_at_deadline() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let executable = dir.path().join("chromium");
        std::fs::write(&executable, "#!/bin/sh\nexec sleep 5\n").unwrap();
        std::fs::set_permissions(&executable, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = RenderConfig {
            tile_wait_ms: 100,
            browser_grace_ms: 200,
            ..RenderConfig::default()
        };
        let engine = BrowserEngine::new(executable, &config);

        let started = Instant::now();
        let result = engine.render(&[(52.0, -2.0), (52.1, -2.1)], 200, 100);
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
