//! Layers command: one detection pass, printed.

use anyhow::{Result, bail};
use gamehud_core::config::Config;
use gamehud_core::frames::FrameSampler;
use gamehud_core::layers::{ExclusionClassifier, LayerClassifier, LayerDetector};
use gamehud_core::shell::{Shell, ShellChannel};

pub async fn run(config: &Config) -> Result<()> {
    let mut shell = ShellChannel::new(config.shell.clone());
    if !shell.open().await {
        shell.close().await;
        bail!(
            "Privileged shell `{}` unavailable, cannot query the compositor",
            config.shell.program
        );
    }

    let result = report(config, &mut shell).await;
    shell.close().await;
    result
}

async fn report(config: &Config, shell: &mut ShellChannel) -> Result<()> {
    let classifier = ExclusionClassifier::from_config(&config.layers);
    let listing = shell.execute(&config.compositor.list_command).await?;

    println!("Layers (+ candidate, - excluded):");
    for layer in listing.iter().map(|l| l.trim()).filter(|l| !l.is_empty()) {
        let mark = if classifier.is_excluded(layer) { '-' } else { '+' };
        println!("  {mark} {layer}");
    }

    let mut detector = LayerDetector::from_config(&config.layers, &config.compositor);
    let mut frames = FrameSampler::new(&config.compositor);

    let selected = detector.detect(shell, &mut frames).await?;
    println!(
        "Focused package: {}",
        detector.tracked().focused_package().unwrap_or("(none)")
    );
    match selected {
        Some((layer, fps)) => println!("Selected layer: {layer} ({fps} FPS)"),
        None => println!("Selected layer: (none)"),
    }
    Ok(())
}
