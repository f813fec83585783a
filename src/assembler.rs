use crate::analysis_tasks::AnalysisTask;
use crate::cluster_messages::{RegionalWorkResult, ResultShapeError};
use crate::time_grid::{GridHeader, GridWriter};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error("task id {0} outside job of {1} tasks")]
    TaskIdOutOfRange(i32, usize),
    #[error("malformed result: {0}")]
    Malformed(#[from] ResultShapeError),
    #[error("result for job {job_id} is missing the {missing} payload")]
    MissingPayload { job_id: String, missing: &'static str },
    #[error("assembler io failure: {0}")]
    Io(#[from] io::Error),
}

struct AssemblerInner {
    /// One accessibility block per origin cell.
    access_writer: Option<GridWriter>,
    /// One destination-major travel time block per origin.
    times_writer: Option<GridWriter>,
    origin_written: Vec<bool>,
    n_written: usize,
    finalized: bool,
}

/// Collects the per-origin results of one job into its output file(s).
/// Results arrive out of order, possibly duplicated; every task id maps to a
/// fixed byte offset so writes commute and replays are no-ops at the byte
/// level. Own lock, separate from the broker's: result bytes hit disk
/// outside the scheduling critical section.
pub struct MultiOriginAssembler {
    pub job_id: String,
    n_tasks_total: usize,
    n_percentiles: usize,
    n_targets: usize,
    inner: Mutex<AssemblerInner>,
}

impl MultiOriginAssembler {
    /// Create writers for whichever outputs the template records, with
    /// pre-sized temp files next to the system temp dir.
    pub fn new(template: &AnalysisTask, n_tasks_total: usize) -> Result<MultiOriginAssembler, AssemblerError> {
        let Some(detail) = template.regional() else {
            return Err(AssemblerError::MissingPayload {
                job_id: "<template>".to_string(),
                missing: "regional detail",
            });
        };
        let job_id = detail.job_id.clone();
        let n_percentiles = template.n_percentiles();
        let n_targets = template.n_targets();
        let temp_dir = std::env::temp_dir();

        let access_writer = if detail.record_accessibility {
            // origin grid: the job's tasks are its grid cells in row-major order
            let header = GridHeader {
                zoom: template.zoom,
                west: template.west,
                north: template.north,
                width: template.width,
                height: template.height,
                n_values_per_pixel: n_percentiles as i32,
            };
            let path = temp_dir.join(format!("{}_access_{}.grid", job_id, uuid::Uuid::new_v4()));
            Some(GridWriter::create(&path, header, n_tasks_total, n_percentiles)?)
        } else {
            None
        };

        let times_writer = if detail.record_times {
            // destination grid header; one block of all destinations per origin
            let header = GridHeader {
                zoom: template.zoom,
                west: template.west,
                north: template.north,
                width: template.width,
                height: template.height,
                n_values_per_pixel: n_percentiles as i32,
            };
            let path = temp_dir.join(format!("{}_times_{}.grid", job_id, uuid::Uuid::new_v4()));
            Some(GridWriter::create(
                &path,
                header,
                n_tasks_total,
                n_targets * n_percentiles,
            )?)
        } else {
            None
        };

        Ok(MultiOriginAssembler {
            job_id,
            n_tasks_total,
            n_percentiles,
            n_targets,
            inner: Mutex::new(AssemblerInner {
                access_writer,
                times_writer,
                origin_written: vec![false; n_tasks_total],
                n_written: 0,
                finalized: false,
            }),
        })
    }

    /// Slot one result into the output files. Returns the finished
    /// `(storage key, local file)` pairs when this was the last origin the
    /// assembler was waiting for, `None` otherwise.
    pub fn handle_message(
        &self,
        result: &RegionalWorkResult,
    ) -> Result<Option<Vec<(String, PathBuf)>>, AssemblerError> {
        let Ok(index) = usize::try_from(result.task_id) else {
            return Err(AssemblerError::TaskIdOutOfRange(result.task_id, self.n_tasks_total));
        };
        if index >= self.n_tasks_total {
            return Err(AssemblerError::TaskIdOutOfRange(result.task_id, self.n_tasks_total));
        }
        result.check_shape(self.n_percentiles, self.n_targets)?;

        let mut inner = self.inner.lock().unwrap();
        if inner.finalized {
            // stray redelivery arriving after the job finished; files are gone
            return Ok(None);
        }
        if let Some(writer) = inner.access_writer.as_mut() {
            let accessibility = result.accessibility.as_ref().ok_or_else(|| {
                AssemblerError::MissingPayload {
                    job_id: self.job_id.clone(),
                    missing: "accessibility",
                }
            })?;
            let values: Vec<i32> = accessibility[0][0].clone();
            writer.write_entry(index, &values)?;
        }
        if let Some(writer) = inner.times_writer.as_mut() {
            let times = result.travel_times_by_percentile.as_ref().ok_or_else(|| {
                AssemblerError::MissingPayload {
                    job_id: self.job_id.clone(),
                    missing: "travel times",
                }
            })?;
            // interleave destination-major so one destination's percentiles
            // sit together, matching the (y, x, percentile) order of the
            // single point grids
            let mut block = Vec::with_capacity(self.n_targets * self.n_percentiles);
            for target in 0..self.n_targets {
                for row in times {
                    block.push(row[target]);
                }
            }
            writer.write_entry(index, &block)?;
        }

        if !inner.origin_written[index] {
            inner.origin_written[index] = true;
            inner.n_written += 1;
        }
        if inner.n_written == self.n_tasks_total {
            inner.finalized = true;
            let mut files = Vec::new();
            if let Some(mut writer) = inner.access_writer.take() {
                writer.flush()?;
                files.push((format!("{}_access.grid", self.job_id), writer.path().to_path_buf()));
            }
            if let Some(mut writer) = inner.times_writer.take() {
                writer.flush()?;
                files.push((format!("{}_times.grid", self.job_id), writer.path().to_path_buf()));
            }
            log::info!(
                "job {}: all {} origins assembled, handing off {} file(s)",
                self.job_id,
                self.n_tasks_total,
                files.len()
            );
            return Ok(Some(files));
        }
        Ok(None)
    }

    /// Drop the output files, e.g. when the job is deleted mid-flight.
    pub fn terminate(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.finalized = true;
        if let Some(writer) = inner.access_writer.take() {
            writer.terminate()?;
        }
        if let Some(writer) = inner.times_writer.take() {
            writer.terminate()?;
        }
        Ok(())
    }
}
