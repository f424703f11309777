use crate::melt::store::TreeEntry;
use anyhow::{Context, Result};
use std::io::Write;

/// Writes tree entries as JSON Lines, one `{"path", "node", "value"}` object per line
pub struct TreeWriter<W: Write> {
    writer: W,
}

impl<W: Write> TreeWriter<W> {
    pub fn new(writer: W) -> Self {
        TreeWriter { writer }
    }

    pub fn write_entries(&mut self, entries: &[TreeEntry]) -> Result<()> {
        for entry in entries {
            let json = serde_json::to_string(entry)
                .with_context(|| format!("Failed to serialize {}", entry.path))?;
            writeln!(self.writer, "{}", json)
                .context("Failed to write entry")?;
        }
        Ok(())
    }

    /// Write only paths holding a value, as `{"<path>": <value>}` lines
    pub fn write_values(&mut self, entries: &[TreeEntry]) -> Result<()> {
        for entry in entries {
            let Some(value) = &entry.value else {
                continue;
            };
            let mut line = serde_json::Map::new();
            line.insert(entry.path.clone(), value.clone());
            let json = serde_json::to_string(&line)
                .context("Failed to serialize value")?;
            writeln!(self.writer, "{}", json)
                .context("Failed to write value")?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Failed to flush writer")
    }
}
