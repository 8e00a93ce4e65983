//! Run persistence. A run and its trees are written as one batch.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{DetectError, ReportError};
use crate::run::DetectionRun;
use crate::tree_detection::DetectedTree;

pub const RUN_FILE: &str = "run.json";
pub const TREES_FILE: &str = "trees.csv";

/// Destination for finished runs (completed or failed).
pub trait RunStore {
    /// Store the run and all its trees. Storing a run id again replaces it.
    fn persist(&mut self, run: &DetectionRun) -> Result<(), DetectError>;
}

/// Keeps runs in memory.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Vec<DetectionRun>,
}

impl MemoryRunStore {
    pub fn get(&self, id: &str) -> Option<&DetectionRun> {
        self.runs.iter().find(|r| r.id() == id)
    }

    pub fn runs(&self) -> &[DetectionRun] {
        &self.runs
    }
}

impl RunStore for MemoryRunStore {
    fn persist(&mut self, run: &DetectionRun) -> Result<(), DetectError> {
        self.runs.retain(|r| r.id() != run.id());
        self.runs.push(run.clone());
        Ok(())
    }
}

/// One directory per run under `root`, holding `run.json` and `trees.csv`.
///
/// Both files are written next to their final name and renamed into place,
/// trees first; `run.json` appearing marks the batch as complete.
#[derive(Debug, Clone)]
pub struct CsvRunStore {
    root: PathBuf,
}

impl CsvRunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Read a stored run back, with its trees.
    pub fn load(&self, id: &str) -> Result<DetectionRun, ReportError> {
        let dir = self.run_dir(id);
        let run_path = dir.join(RUN_FILE);
        let file = File::open(&run_path).map_err(|e| ReportError::io(&run_path, e))?;
        let run: DetectionRun = serde_json::from_reader(BufReader::new(file))?;
        let trees = read_trees_csv(&dir.join(TREES_FILE))?;
        Ok(run.with_trees(trees))
    }

    fn write_batch(&self, run: &DetectionRun) -> Result<(), ReportError> {
        let dir = self.run_dir(run.id());
        fs::create_dir_all(&dir).map_err(|e| ReportError::io(&dir, e))?;

        let trees_path = dir.join(TREES_FILE);
        let trees_tmp = dir.join(format!("{TREES_FILE}.tmp"));
        write_trees_csv(&trees_tmp, run.trees())?;

        let run_path = dir.join(RUN_FILE);
        let run_tmp = dir.join(format!("{RUN_FILE}.tmp"));
        {
            let file = File::create(&run_tmp).map_err(|e| ReportError::io(&run_tmp, e))?;
            let mut w = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut w, run)?;
            w.flush().map_err(|e| ReportError::io(&run_tmp, e))?;
        }

        fs::rename(&trees_tmp, &trees_path).map_err(|e| ReportError::io(&trees_path, e))?;
        fs::rename(&run_tmp, &run_path).map_err(|e| ReportError::io(&run_path, e))?;
        debug!("run {} written to {}", run.id(), dir.display());
        Ok(())
    }
}

impl RunStore for CsvRunStore {
    fn persist(&mut self, run: &DetectionRun) -> Result<(), DetectError> {
        self.write_batch(run)
            .map_err(|e| DetectError::Persist(e.to_string()))
    }
}

/// Write trees as CSV with a header row.
pub fn write_trees_csv(path: &Path, trees: &[DetectedTree]) -> Result<(), ReportError> {
    let mut wtr = csv::Writer::from_path(path)?;
    if trees.is_empty() {
        wtr.write_record([
            "id",
            "lat",
            "lon",
            "pixel_row",
            "pixel_col",
            "canopy_diameter_m",
            "vegetation_index",
            "confidence",
        ])?;
    }
    for t in trees {
        wtr.serialize(t)?;
    }
    wtr.flush().map_err(|e| ReportError::io(path, e))?;
    Ok(())
}

/// Read trees written by [`write_trees_csv`].
pub fn read_trees_csv(path: &Path) -> Result<Vec<DetectedTree>, ReportError> {
    let mut rdr = csv::Reader::from_path(path)?;
    let mut trees = Vec::new();
    for row in rdr.deserialize() {
        trees.push(row?);
    }
    Ok(trees)
}
