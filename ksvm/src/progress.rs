use anyhow::Result;
use std::{
    io::{IsTerminal, Read, Write},
    time::Duration,
};

pub enum ProgressBar {
    /// A hashing operation
    Hash,
}

impl ProgressBar {
    fn create_progressbar(&self, len: u64) -> Result<indicatif::ProgressBar> {
        let color = match self {
            ProgressBar::Hash => "blue",
        };

        let progress = indicatif::ProgressBar::new(len);
        progress.set_style(
            indicatif::ProgressStyle::default_bar()
                .template(&format!("{{spinner:.{color}}} [{{elapsed_precise}}] [{{wide_bar:.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})"))?
                .progress_chars("=>-"),
        );
        progress.enable_steady_tick(Duration::from_millis(50));
        Ok(progress)
    }

    /// Fully copy the given reader to the given writer and display a
    /// progressbar if running in interactive mode.
    pub fn copy(&self, reader: &mut dyn Read, writer: &mut dyn Write, len: u64) -> Result<u64> {
        if !show_progress() {
            return Ok(std::io::copy(reader, writer)?);
        }

        let progress = self.create_progressbar(len)?;
        let copied = std::io::copy(reader, &mut progress.wrap_write(writer))?;
        progress.finish_and_clear();
        Ok(copied)
    }
}

fn show_progress() -> bool {
    std::io::stdout().is_terminal() && std::env::var("CI").is_err()
}
