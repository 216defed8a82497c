use crate::errors::Result;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use tracing::info;

/// A writer that can force its contents to stable storage.
pub trait Durable: Write {
    fn sync(&mut self) -> io::Result<()>;
}

impl Durable for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

#[cfg(test)]
impl Durable for Vec<u8> {
    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Append-only record of switch acknowledgments. Every record is synced
/// before `record` returns.
#[derive(Debug)]
pub struct AuditLog<W> {
    out: W,
}

impl AuditLog<File> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("Audit log: {}", path.display());
        Ok(Self::new(file))
    }
}

impl<W: Durable> AuditLog<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Writes a headline, an indented detail line and a blank separator.
    pub fn record(&mut self, headline: &str, detail: &str) -> Result<()> {
        writeln!(self.out, "{}", headline)?;
        writeln!(self.out, "   {}", detail)?;
        writeln!(self.out)?;
        self.out.flush()?;
        self.out.sync()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn get_ref(&self) -> &W {
        &self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let mut log = AuditLog::new(Vec::new());
        log.record("headline", "detail").unwrap();

        assert_eq!(
            String::from_utf8(log.get_ref().clone()).unwrap(),
            "headline\n   detail\n\n"
        );
    }

    #[test]
    fn test_file_appends() {
        let path = std::env::temp_dir().join(format!("audit-{}.log", uuid::Uuid::new_v4()));
        {
            let mut log = AuditLog::open(&path).unwrap();
            log.record("one", "a").unwrap();
        }
        {
            let mut log = AuditLog::open(&path).unwrap();
            log.record("two", "b").unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(text, "one\n   a\n\ntwo\n   b\n\n");
    }
}
