//! Probe command handler.

use anyhow::Result;
use gamehud_core::config::Config;
use gamehud_core::shell::ShellChannel;

pub async fn run(config: &Config) -> Result<()> {
    let program = &config.shell.program;
    let mut shell = ShellChannel::new(config.shell.clone());

    if shell.open().await {
        println!("Privileged shell available via `{program}`");
    } else if shell.is_open() {
        println!(
            "Shell `{program}` started but `{}` did not report `{}`; frame metrics disabled",
            config.shell.probe_command, config.shell.privileged_marker
        );
    } else {
        println!("Shell `{program}` could not be started; frame metrics disabled");
    }

    shell.close().await;
    Ok(())
}
