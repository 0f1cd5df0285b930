//! The experiment log: the single audit trail of a run. Every record is
//! numbered, stamped, and mirrored to the `log` facade.

use chrono::Local;
use log::info;
use std::{
    fmt,
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex},
};

/// One entry of the experiment log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Starts at 1 and increases by one per record.
    pub sequence: u64,
    #[allow(missing_docs)]
    pub experiment: String,
    /// The animal or species under test.
    pub subject: String,
    /// Local time, `%Y-%m-%d_%H:%M:%S%.3f`.
    pub timestamp: String,
    #[allow(missing_docs)]
    pub message: String,
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}_{}",
            self.sequence, self.experiment, self.subject, self.timestamp, self.message
        )
    }
}

#[derive(Debug, Default)]
struct Journal {
    experiment: String,
    subject: String,
    records: Vec<LogRecord>,
}

/// A cloneable handle to the log; all clones append to the same journal.
#[derive(Debug, Clone, Default)]
pub struct ExperimentLog {
    journal: Arc<Mutex<Journal>>,
}

impl ExperimentLog {
    #[allow(missing_docs)]
    pub fn new(experiment: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            journal: Arc::new(Mutex::new(Journal {
                experiment: experiment.into(),
                subject: subject.into(),
                records: Vec::new(),
            })),
        }
    }

    /// Append a message and return the record that was stored.
    pub fn record(&self, message: impl Into<String>) -> LogRecord {
        let mut journal = self.journal.lock().unwrap();
        let record = LogRecord {
            sequence: journal.records.len() as u64 + 1,
            experiment: journal.experiment.clone(),
            subject: journal.subject.clone(),
            timestamp: Local::now().format("%Y-%m-%d_%H:%M:%S%.3f").to_string(),
            message: message.into(),
        };
        info!("{}", record);
        journal.records.push(record.clone());
        record
    }

    /// A copy of every record so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.journal.lock().unwrap().records.clone()
    }

    /// Messages only, in order. Mostly handy for checks.
    pub fn messages(&self) -> Vec<String> {
        self.journal
            .lock()
            .unwrap()
            .records
            .iter()
            .map(|r| r.message.clone())
            .collect()
    }

    /// Empty the journal; numbering starts again at 1.
    pub fn clear(&self) {
        self.journal.lock().unwrap().records.clear();
    }

    /// Write one record per line to `path`.
    pub fn to_path(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let mut handle = BufWriter::new(File::create(path)?);
        self.to_file(&mut handle)?;
        handle.flush()
    }

    /// Write one record per line to the [Write]able object provided.
    pub fn to_file(&self, file: &mut impl Write) -> io::Result<()> {
        for record in self.records() {
            writeln!(file, "{}", record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_numbered_in_order() {
        let log = ExperimentLog::new("pilot", "Zebra finch");
        log.record("first");
        let second = log.record("second");

        assert_eq!(second.sequence, 2);
        assert_eq!(log.messages(), vec!["first", "second"]);

        log.clear();
        assert_eq!(log.record("again").sequence, 1);
    }

    #[test]
    fn line_form_joins_fields_with_underscores() {
        let record = LogRecord {
            sequence: 3,
            experiment: "pilot".to_owned(),
            subject: "Budgerigar".to_owned(),
            timestamp: "2024-05-03_14:12:03.250".to_owned(),
            message: "Song A played this file: a.wav".to_owned(),
        };
        assert_eq!(
            record.to_string(),
            "3_pilot_Budgerigar_2024-05-03_14:12:03.250_Song A played this file: a.wav"
        );
    }

    #[test]
    fn clones_share_the_journal() {
        let log = ExperimentLog::new("pilot", "Zebra finch");
        let other = log.clone();
        other.record("from the clone");
        assert_eq!(log.records().len(), 1);
    }

    #[test]
    fn export_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let log = ExperimentLog::new("pilot", "Zebra finch");
        log.record("one");
        log.record("two");
        log.to_path(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("1_pilot_Zebra finch_"));
        assert!(lines[1].ends_with("_two"));
    }
}
