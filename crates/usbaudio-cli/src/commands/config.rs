//! Print effective stream settings and report problems.

use std::path::PathBuf;

use anyhow::bail;
use clap::Args;

use super::load_settings;

/// Print or check stream settings.
#[derive(Args)]
pub struct ConfigArgs {
    /// Settings file; defaults are used when omitted
    pub file: Option<PathBuf>,

    /// Only check the settings, print nothing on success
    #[arg(long)]
    pub check: bool,

    /// Also write the effective settings to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Run the config command.
pub fn run(args: ConfigArgs) -> anyhow::Result<()> {
    let settings = load_settings(args.file.as_deref())?;
    let problems = settings.validate();

    if !args.check {
        print!("{}", settings.to_toml()?);
    }
    if let Some(path) = &args.output {
        settings.save(path)?;
        tracing::info!(path = %path.display(), "settings written");
    }

    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("error: {problem}");
        }
        bail!("{} problem(s) in stream settings", problems.len());
    }

    if !args.check {
        let format = settings.stream_format();
        let session = settings.session_config();
        println!();
        println!("# frame:       {} bytes", format.bytes_per_frame());
        println!("# max packet:  {} bytes", format.max_packet_bytes(session.bus));
        println!("# ring:        {} bytes", session.ring_bytes());
        println!(
            "# ring period: {:.3} ms",
            session.ring_bytes() as f64 * format.ns_per_byte() / 1e6
        );
    }
    Ok(())
}
