//! Writes a finished run to disk: the experiment log as text, one record
//! per line, and the count snapshots as RON.

use crate::count_store::CountSnapshot;
use crate::experiment_log::ExperimentLog;

use log::info;
use ron::ser::PrettyConfig;
use std::{
    borrow::Cow,
    fmt, fs, io,
    path::{Path, PathBuf},
};

/// Could not write the export.
#[derive(Debug)]
pub enum ExportError {
    #[allow(missing_docs)]
    Io(io::Error),
    #[allow(missing_docs)]
    Ron(ron::Error),
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ExportError::Io(e) => Cow::from(format!("could not write export: {e}")),
            ExportError::Ron(e) => Cow::from(format!("could not serialize counts: {e}")),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for ExportError {}

impl From<io::Error> for ExportError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ron::Error> for ExportError {
    fn from(value: ron::Error) -> Self {
        Self::Ron(value)
    }
}

/// The files an export produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exported {
    #[allow(missing_docs)]
    pub log: PathBuf,
    #[allow(missing_docs)]
    pub counts: PathBuf,
}

/// Write `log` and `snapshots` into `dir`, named after the experiment and
/// subject. The directory is created if needed.
pub fn export(
    dir: &Path,
    stem: &str,
    log: &ExperimentLog,
    snapshots: &[CountSnapshot],
) -> Result<Exported, ExportError> {
    fs::create_dir_all(dir)?;
    let stem: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect();

    let exported = Exported {
        log: dir.join(format!("{stem}_log.txt")),
        counts: dir.join(format!("{stem}_counts.ron")),
    };
    log.to_path(&exported.log)?;
    let text = ron::ser::to_string_pretty(snapshots, PrettyConfig::default())?;
    fs::write(&exported.counts, text)?;

    info!(
        "Exported {} and {}",
        exported.log.display(),
        exported.counts.display()
    );
    Ok(exported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::count_store::{CountStore, SnapshotReason};
    use crate::schedule::WindowId;
    use crate::stimulus::Position;

    #[test]
    fn writes_log_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("exports");

        let log = ExperimentLog::new("pilot", "Zebra finch");
        log.record("Start");
        let counts = CountStore::new();
        counts.record(WindowId(1), Position::new(2).unwrap(), 9);
        counts.take_snapshot(SnapshotReason::Final);

        let exported = export(&out, "pilot Zebra finch", &log, &counts.history()).unwrap();
        assert_eq!(exported.log, out.join("pilot_Zebra_finch_log.txt"));

        let text = fs::read_to_string(&exported.log).unwrap();
        assert!(text.trim_end().ends_with("_Start"));

        let back: Vec<CountSnapshot> =
            ron::de::from_str(&fs::read_to_string(&exported.counts).unwrap()).unwrap();
        assert_eq!(back, counts.history());
        assert_eq!(back[0].get(WindowId(1), Position::new(2).unwrap()), 9);
    }
}
