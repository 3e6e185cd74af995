//! Active render-layer detection.
//!
//! The compositor lists every surface by name and nothing marks which one is
//! the game. Detection filters out system surfaces, prefers layers owned by
//! the focused package, and confirms a candidate only if it is presenting
//! frames right now.

use tracing::{debug, info, warn};

use crate::config::{CompositorConfig, LayersConfig};
use crate::frames::FrameSampler;
use crate::shell::{Shell, ShellError};
use crate::snapshot::Fps;

/// Strategy deciding which layer names can be the game.
pub trait LayerClassifier: Send {
    /// Whether `layer` must never be tracked.
    fn is_excluded(&self, layer: &str) -> bool;

    /// Whether `layer` belongs to `package`.
    fn belongs_to(&self, layer: &str, package: &str) -> bool {
        layer.contains(package)
    }
}

/// Substring-based classifier driven by `[layers]` config.
#[derive(Debug, Clone)]
pub struct ExclusionClassifier {
    own_package: String,
    excluded: Vec<String>,
}

impl ExclusionClassifier {
    pub fn new(own_package: impl Into<String>, excluded: Vec<String>) -> Self {
        Self {
            own_package: own_package.into(),
            excluded,
        }
    }

    pub fn from_config(config: &LayersConfig) -> Self {
        Self::new(config.own_package.clone(), config.excluded.clone())
    }
}

impl LayerClassifier for ExclusionClassifier {
    fn is_excluded(&self, layer: &str) -> bool {
        if layer.trim().is_empty() {
            return true;
        }
        if !self.own_package.is_empty() && layer.contains(&self.own_package) {
            return true;
        }
        self.excluded
            .iter()
            .any(|pattern| !pattern.is_empty() && layer.contains(pattern.as_str()))
    }
}

/// The detector's current belief about the game layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedLayer {
    layer: Option<String>,
    zero_polls: u32,
    focused_package: Option<String>,
}

impl TrackedLayer {
    pub fn layer(&self) -> Option<&str> {
        self.layer.as_deref()
    }

    /// Consecutive polls in which the tracked layer presented no frame.
    pub fn zero_polls(&self) -> u32 {
        self.zero_polls
    }

    pub fn focused_package(&self) -> Option<&str> {
        self.focused_package.as_deref()
    }
}

/// Extracts the package owning input focus from a window dump.
///
/// Looks for the `mCurrentFocus` line and takes the text between the user
/// marker `u0 ` and the following `/`.
pub fn parse_focused_package<S: AsRef<str>>(lines: &[S]) -> Option<String> {
    lines.iter().map(AsRef::as_ref).find_map(|line| {
        if !line.contains("mCurrentFocus") {
            return None;
        }
        let start = line.find("u0 ")? + 3;
        let rest = &line[start..];
        let slash = rest.find('/')?;
        let package = rest[..slash].trim();
        (!package.is_empty()).then(|| package.to_string())
    })
}

/// Picks and keeps track of the layer whose frames are counted.
pub struct LayerDetector {
    classifier: Box<dyn LayerClassifier>,
    compositor: CompositorConfig,
    redetect_after: u32,
    tracked: TrackedLayer,
}

impl LayerDetector {
    pub fn new(
        classifier: Box<dyn LayerClassifier>,
        compositor: CompositorConfig,
        redetect_after: u32,
    ) -> Self {
        Self {
            classifier,
            compositor,
            redetect_after,
            tracked: TrackedLayer::default(),
        }
    }

    pub fn from_config(layers: &LayersConfig, compositor: &CompositorConfig) -> Self {
        Self::new(
            Box::new(ExclusionClassifier::from_config(layers)),
            compositor.clone(),
            layers.redetect_after_zero_polls,
        )
    }

    pub fn tracked(&self) -> &TrackedLayer {
        &self.tracked
    }

    /// Drops the tracked layer, e.g. when the shell lost its privileges.
    pub fn forget(&mut self) {
        if let Some(layer) = self.tracked.layer.take() {
            debug!(layer, "stopped tracking render layer");
        }
        self.tracked.zero_polls = 0;
    }

    /// A threshold of zero behaves like one: a layer is only abandoned after
    /// it actually presented nothing.
    fn needs_redetect(&self) -> bool {
        self.tracked.layer.is_none() || self.tracked.zero_polls >= self.redetect_after.max(1)
    }

    /// Lists compositor layers that survive the classifier, in dump order.
    pub async fn candidates<S: Shell>(&self, shell: &mut S) -> Result<Vec<String>, ShellError> {
        let listing = shell.execute(&self.compositor.list_command).await?;
        Ok(listing
            .into_iter()
            .map(|line| line.trim().to_string())
            .filter(|line| !self.classifier.is_excluded(line))
            .collect())
    }

    /// Package currently owning input focus, if the window dump names one.
    pub async fn focused_package<S: Shell>(
        &self,
        shell: &mut S,
    ) -> Result<Option<String>, ShellError> {
        let lines = shell.execute(&self.compositor.focus_command).await?;
        Ok(parse_focused_package(&lines))
    }

    /// Runs a full detection pass.
    ///
    /// Returns the chosen layer with the frame count its trial query produced.
    pub async fn detect<S: Shell>(
        &mut self,
        shell: &mut S,
        frames: &mut FrameSampler,
    ) -> Result<Option<(String, u32)>, ShellError> {
        let candidates = self.candidates(shell).await?;
        if candidates.is_empty() {
            debug!("compositor listed no trackable layer");
            return Ok(None);
        }

        let focused = self.focused_package(shell).await?;
        self.tracked.focused_package.clone_from(&focused);

        let mut tried = vec![false; candidates.len()];
        if let Some(package) = focused.as_deref() {
            for (index, layer) in candidates.iter().enumerate() {
                if !self.classifier.belongs_to(layer, package) {
                    continue;
                }
                tried[index] = true;
                let fps = frames.sample(shell, layer).await?;
                if fps > 0 {
                    return Ok(Some((layer.clone(), fps)));
                }
            }
        }

        for (index, layer) in candidates.iter().enumerate() {
            if tried[index] {
                continue;
            }
            let fps = frames.sample(shell, layer).await?;
            if fps > 0 {
                return Ok(Some((layer.clone(), fps)));
            }
        }

        Ok(None)
    }

    /// Produces this tick's FPS, re-detecting the layer when needed.
    ///
    /// The tracked layer is re-detected when there is none, or after it
    /// presented nothing for the configured number of consecutive polls.
    pub async fn poll<S: Shell>(&mut self, shell: &mut S, frames: &mut FrameSampler) -> Fps {
        if !shell.is_privileged() {
            self.forget();
            return Fps::Unavailable;
        }

        match self.poll_tracked(shell, frames).await {
            Ok(fps) => fps,
            Err(err) => {
                warn!(%err, "frame sampling failed");
                Fps::Unavailable
            }
        }
    }

    async fn poll_tracked<S: Shell>(
        &mut self,
        shell: &mut S,
        frames: &mut FrameSampler,
    ) -> Result<Fps, ShellError> {
        if !self.needs_redetect()
            && let Some(layer) = self.tracked.layer.clone()
        {
            let fps = frames.sample(shell, &layer).await?;
            if fps == 0 {
                self.tracked.zero_polls += 1;
            } else {
                self.tracked.zero_polls = 0;
            }
            return Ok(Fps::Measured(fps));
        }

        self.tracked.zero_polls = 0;
        match self.detect(shell, frames).await? {
            Some((layer, fps)) => {
                if self.tracked.layer.as_deref() != Some(layer.as_str()) {
                    info!(layer, "tracking render layer");
                }
                self.tracked.layer = Some(layer);
                Ok(Fps::Measured(fps))
            }
            None => {
                self.forget();
                Ok(Fps::Unavailable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::tests::{FakeShell, dump, fixed_now};

    const LIST: &str = "dumpsys SurfaceFlinger --list";
    const FOCUS: &str = "dumpsys window windows";

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    fn sampler() -> FrameSampler {
        FrameSampler::new(&CompositorConfig::default()).with_clock(fixed_now)
    }

    fn detector(redetect_after: u32) -> LayerDetector {
        let layers = LayersConfig {
            redetect_after_zero_polls: redetect_after,
            ..LayersConfig::default()
        };
        LayerDetector::from_config(&layers, &CompositorConfig::default())
    }

    fn focus_dump(package: &str) -> Vec<String> {
        vec![
            "WINDOW MANAGER WINDOWS (dumpsys window windows)".to_string(),
            format!("  mCurrentFocus=Window{{5e3f1d u0 {package}/{package}.MainActivity}}"),
            format!("  mFocusedApp=ActivityRecord{{9a1 u0 {package}/.MainActivity t12}}"),
        ]
    }

    #[test]
    fn test_default_classifier_exclusions() {
        let classifier = ExclusionClassifier::from_config(&LayersConfig::default());

        for layer in [
            "StatusBar#0",
            "NavigationBar0#0",
            "InputMethod#0",
            "com.android.systemui.ImageWallpaper#0",
            "ScreenshotSurface#0",
            "Background for SurfaceView[com.game/Main]#0",
            "Output Layer",
            "SurfaceView[com.catsmoker.app/Overlay]#0",
            "   ",
        ] {
            assert!(classifier.is_excluded(layer), "{layer} should be excluded");
        }
        assert!(!classifier.is_excluded("SurfaceView[com.game/Main]#0"));
    }

    #[test]
    fn test_parse_focused_package() {
        assert_eq!(
            parse_focused_package(&focus_dump("com.game")),
            Some("com.game".to_string())
        );
        assert_eq!(
            parse_focused_package(&["  mCurrentFocus=null", "mFocusedApp=null"]),
            None
        );
        assert_eq!(
            parse_focused_package(&["mCurrentFocus=Window{1 u0 /odd}"]),
            None
        );
    }

    #[tokio::test]
    async fn test_focused_package_layer_wins() {
        let mut shell = FakeShell::privileged();
        let mut frames = sampler();
        let mut detector = detector(3);
        shell.respond(
            LIST,
            strings(&["StatusBar", "SurfaceView/com.other/Main#0", "SurfaceView/com.game/Main#0", "ImageWallpaper"]),
        );
        shell.respond(FOCUS, focus_dump("com.game"));
        shell.respond(&frames.latency_command("SurfaceView/com.other/Main#0"), dump(&[5, 10]));
        shell.respond(&frames.latency_command("SurfaceView/com.game/Main#0"), dump(&[5, 10, 15]));

        let fps = detector.poll(&mut shell, &mut frames).await;

        assert_eq!(fps, Fps::Measured(3));
        assert_eq!(detector.tracked().layer(), Some("SurfaceView/com.game/Main#0"));
        assert_eq!(detector.tracked().focused_package(), Some("com.game"));
    }

    #[tokio::test]
    async fn test_focused_scenario_from_three_layer_list() {
        let mut shell = FakeShell::privileged();
        let mut frames = sampler();
        let mut detector = detector(3);
        shell.respond(
            LIST,
            strings(&["StatusBar", "SurfaceView/com.game/Main#0", "ImageWallpaper"]),
        );
        shell.respond(FOCUS, focus_dump("com.game"));
        shell.respond(&frames.latency_command("SurfaceView/com.game/Main#0"), dump(&[100]));

        detector.poll(&mut shell, &mut frames).await;

        assert_eq!(detector.tracked().layer(), Some("SurfaceView/com.game/Main#0"));
    }

    #[tokio::test]
    async fn test_falls_back_to_first_moving_layer() {
        let mut shell = FakeShell::privileged();
        let mut frames = sampler();
        let mut detector = detector(3);
        shell.respond(LIST, strings(&["still#0", "moving#0", "also-moving#0"]));
        shell.respond(FOCUS, focus_dump("com.absent"));
        shell.respond(&frames.latency_command("still#0"), dump(&[]));
        shell.respond(&frames.latency_command("moving#0"), dump(&[1, 2]));
        shell.respond(&frames.latency_command("also-moving#0"), dump(&[1, 2, 3]));

        let fps = detector.poll(&mut shell, &mut frames).await;

        assert_eq!(fps, Fps::Measured(2));
        assert_eq!(detector.tracked().layer(), Some("moving#0"));
        assert_eq!(shell.count(&frames.latency_command("also-moving#0")), 0);
    }

    #[tokio::test]
    async fn test_excluded_layer_never_selected() {
        let mut shell = FakeShell::privileged();
        let mut frames = sampler();
        let mut detector = detector(3);
        shell.respond(LIST, strings(&["StatusBar#0", "SurfaceView/com.catsmoker.app/Hud#0"]));
        shell.respond(FOCUS, focus_dump("com.catsmoker.app"));
        shell.respond(&frames.latency_command("StatusBar#0"), dump(&[1, 2, 3]));
        shell.respond(
            &frames.latency_command("SurfaceView/com.catsmoker.app/Hud#0"),
            dump(&[1, 2, 3]),
        );

        let fps = detector.poll(&mut shell, &mut frames).await;

        assert_eq!(fps, Fps::Unavailable);
        assert_eq!(detector.tracked().layer(), None);
        assert_eq!(shell.count(&frames.latency_command("StatusBar#0")), 0);
    }

    #[tokio::test]
    async fn test_empty_listing_is_unavailable() {
        let mut shell = FakeShell::privileged();
        let mut frames = sampler();
        let mut detector = detector(3);

        assert_eq!(detector.poll(&mut shell, &mut frames).await, Fps::Unavailable);
        assert_eq!(shell.count(FOCUS), 0);
    }

    #[tokio::test]
    async fn test_unprivileged_shell_forgets_layer() {
        let mut shell = FakeShell::privileged();
        let mut frames = sampler();
        let mut detector = detector(3);
        shell.respond(LIST, strings(&["game#0"]));
        shell.respond(&frames.latency_command("game#0"), dump(&[1]));
        assert_eq!(detector.poll(&mut shell, &mut frames).await, Fps::Measured(1));

        shell.privileged = false;
        let calls_before = shell.calls.len();

        assert_eq!(detector.poll(&mut shell, &mut frames).await, Fps::Unavailable);
        assert_eq!(detector.tracked().layer(), None);
        assert_eq!(shell.calls.len(), calls_before);
    }

    #[tokio::test]
    async fn test_zero_frames_is_measured_not_unavailable() {
        let mut shell = FakeShell::privileged();
        let mut frames = sampler();
        let mut detector = detector(3);
        let game = frames.latency_command("game#0");
        shell.respond(LIST, strings(&["game#0"]));
        shell.respond(&game, dump(&[1, 2]));
        shell.respond(&game, dump(&[]));

        assert_eq!(detector.poll(&mut shell, &mut frames).await, Fps::Measured(2));
        assert_eq!(detector.poll(&mut shell, &mut frames).await, Fps::Measured(0));
        assert_eq!(detector.tracked().zero_polls(), 1);
        assert_eq!(detector.tracked().layer(), Some("game#0"));
    }

    #[tokio::test]
    async fn test_redetects_once_after_threshold() {
        let mut shell = FakeShell::privileged();
        let mut frames = sampler();
        let mut detector = detector(2);
        let a = frames.latency_command("a#0");
        let b = frames.latency_command("b#0");
        shell.respond(LIST, strings(&["a#0", "b#0"]));
        // a: trial moves, then freezes for good.
        shell.respond(&a, dump(&[1, 2, 3, 4, 5]));
        shell.respond(&a, dump(&[]));
        shell.respond(&b, dump(&[1, 2, 3, 4, 5, 6, 7]));

        let ticks = [
            detector.poll(&mut shell, &mut frames).await,
            detector.poll(&mut shell, &mut frames).await,
            detector.poll(&mut shell, &mut frames).await,
        ];
        assert_eq!(ticks, [Fps::Measured(5), Fps::Measured(0), Fps::Measured(0)]);
        assert_eq!(detector.tracked().zero_polls(), 2);
        assert_eq!(shell.count(LIST), 1);

        // After two zero polls the next tick re-detects and moves to b.
        assert_eq!(detector.poll(&mut shell, &mut frames).await, Fps::Measured(7));
        assert_eq!(detector.tracked().layer(), Some("b#0"));
        assert_eq!(shell.count(LIST), 2);

        for _ in 0..3 {
            assert_eq!(detector.poll(&mut shell, &mut frames).await, Fps::Measured(7));
        }
        assert_eq!(shell.count(LIST), 2);
    }

    #[tokio::test]
    async fn test_threshold_zero_redetects_after_first_zero_poll() {
        let mut shell = FakeShell::privileged();
        let mut frames = sampler();
        let mut detector = detector(0);
        let game = frames.latency_command("game#0");
        shell.respond(LIST, strings(&["game#0"]));
        shell.respond(&game, dump(&[1]));
        shell.respond(&game, dump(&[1]));
        shell.respond(&game, dump(&[]));

        // A moving layer is kept even with a zero threshold.
        assert_eq!(detector.poll(&mut shell, &mut frames).await, Fps::Measured(1));
        assert_eq!(detector.poll(&mut shell, &mut frames).await, Fps::Measured(1));
        assert_eq!(detector.poll(&mut shell, &mut frames).await, Fps::Measured(0));
        assert_eq!(shell.count(LIST), 1);

        // One zero poll is enough; the frozen layer then fails its trial.
        assert_eq!(detector.poll(&mut shell, &mut frames).await, Fps::Unavailable);
        assert_eq!(shell.count(LIST), 2);
        assert_eq!(detector.tracked().layer(), None);
    }
}
