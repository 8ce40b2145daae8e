use anyhow::{bail, Context, Result};
use csv::WriterBuilder;
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use serde::Serialize;
use std::fs::{create_dir_all, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::algorithms::diagnostics::{Convergence, Diagnostics};
use crate::algorithms::{Chain, Status};
use crate::data::{Data, Protocol};
use crate::routines::math::{mean_and_var, quantile_sorted, sorted};
use crate::routines::settings::Predictions;
use crate::simulator::likelihood::Reading;
use crate::simulator::Context as SimulationContext;
use crate::structs::parameters::{Layout, ParameterVector};
use crate::structs::priors::ParameterSpace;

pub mod comparison;
pub mod predictions;

pub use comparison::ProtocolComparison;
pub use predictions::{Calibration, PosteriorPredictive, Residuals};

/// The result of a sampling run
///
/// Holds the draws of every chain together with the diagnostics computed over the chains that produced draws.
#[derive(Debug, Clone, Serialize)]
pub struct PosteriorSummary {
    names: Vec<String>,
    layout: Layout,
    chains: Vec<Chain>,
    diagnostics: Diagnostics,
    status: Status,
}

/// Marginal posterior statistics of a single parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub median: f64,
    #[serde(rename = "q2.5")]
    pub lower: f64,
    #[serde(rename = "q97.5")]
    pub upper: f64,
    pub r_hat: f64,
    pub ess: f64,
}

impl PosteriorSummary {
    pub fn new(space: &ParameterSpace, chains: Vec<Chain>, convergence: &Convergence) -> Self {
        let usable: Vec<&Array2<f64>> = chains
            .iter()
            .filter(|c| !c.failed() && c.ndraws() > 0)
            .map(|c| &c.draws)
            .collect();
        let acceptance = chains.iter().map(|c| c.acceptance_rate).collect();
        let diagnostics = Diagnostics::compute(&usable, acceptance);

        let status = if usable.is_empty() {
            Status::Failed
        } else if chains.iter().any(|c| c.cancelled()) {
            Status::Incomplete
        } else if chains.iter().any(|c| c.failed()) || !convergence.check(&diagnostics) {
            Status::NotConverged
        } else {
            Status::Converged
        };

        PosteriorSummary {
            names: space.names().to_vec(),
            layout: *space.layout(),
            chains,
            diagnostics,
            status,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn converged(&self) -> bool {
        self.status == Status::Converged
    }

    /// Whether every chain ran for the requested number of iterations
    pub fn complete(&self) -> bool {
        matches!(self.status, Status::Converged | Status::NotConverged)
    }

    /// Draws of all chains that did not fail, stacked by rows
    pub fn draws(&self) -> Array2<f64> {
        let views: Vec<ArrayView2<f64>> = self
            .chains
            .iter()
            .filter(|c| !c.failed())
            .map(|c| c.draws.view())
            .collect();
        if views.is_empty() {
            return Array2::zeros((0, self.names.len()));
        }
        concatenate(Axis(0), &views).unwrap_or_else(|_| Array2::zeros((0, self.names.len())))
    }

    pub fn ndraws(&self) -> usize {
        self.chains
            .iter()
            .filter(|c| !c.failed())
            .map(|c| c.ndraws())
            .sum()
    }

    /// Pooled draws of the parameter called `name`
    pub fn parameter_draws(&self, name: &str) -> Option<Vec<f64>> {
        let index = self.names.iter().position(|n| n == name)?;
        Some(self.draws().column(index).to_vec())
    }

    pub fn parameter_summaries(&self) -> Vec<ParameterSummary> {
        let draws = self.draws();
        self.names
            .iter()
            .enumerate()
            .map(|(j, name)| {
                let column = draws.column(j).to_vec();
                let (mean, var) = mean_and_var(&column);
                let ordered = sorted(&column);
                ParameterSummary {
                    name: name.clone(),
                    mean,
                    sd: var.sqrt(),
                    median: quantile_sorted(&ordered, 0.5),
                    lower: quantile_sorted(&ordered, 0.025),
                    upper: quantile_sorted(&ordered, 0.975),
                    r_hat: self.diagnostics.r_hat.get(j).copied().unwrap_or(f64::NAN),
                    ess: self.diagnostics.ess.get(j).copied().unwrap_or(0.0),
                }
            })
            .collect()
    }

    /// Posterior means as a parameter vector
    pub fn point_estimate(&self) -> Result<ParameterVector> {
        let draws = self.draws();
        if draws.nrows() == 0 {
            bail!("The posterior has no draws");
        }
        let means: Vec<f64> = draws
            .mean_axis(Axis(0))
            .map(|m| m.to_vec())
            .unwrap_or_default();
        ParameterVector::from_slice(&self.layout, &means)
    }

    /// Writes every retained draw, with its chain and log posterior density
    pub fn write_draws(&self, folder: &str) -> Result<()> {
        tracing::debug!("Writing posterior draws...");
        let outputfile = OutputFile::new(folder, "draws.csv")?;
        let mut writer = outputfile.csv();

        let mut header = vec!["chain".to_string(), "draw".to_string()];
        header.extend(self.names.iter().cloned());
        header.push("log_density".to_string());
        writer.write_record(&header)?;

        for chain in self.chains.iter().filter(|c| !c.failed()) {
            for (i, row) in chain.draws.rows().into_iter().enumerate() {
                let mut record = vec![chain.id.to_string(), i.to_string()];
                record.extend(row.iter().map(|v| v.to_string()));
                record.push(
                    chain
                        .log_density
                        .get(i)
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                );
                writer.write_record(&record)?;
            }
        }
        writer.flush()?;
        tracing::debug!("Draws written to {:?}", outputfile.path());
        Ok(())
    }

    /// Writes the marginal statistics of every parameter
    pub fn write_summary(&self, folder: &str) -> Result<()> {
        tracing::debug!("Writing parameter summary...");
        OutputFile::new(folder, "summary.csv")?.write_rows(self.parameter_summaries())
    }
}

/// Evaluation of a posterior against the data it was fitted to
///
/// Building a report never modifies the summary.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub status: Status,
    pub parameters: Vec<ParameterSummary>,
    pub diagnostics: Diagnostics,
    pub predictions: PosteriorPredictive,
    pub residuals: Residuals,
    pub calibration: Calibration,
    pub comparison: Option<ProtocolComparison>,
}

impl Report {
    pub fn new(
        summary: &PosteriorSummary,
        data: &Data,
        context: &SimulationContext,
        settings: &Predictions,
        protocol: Option<&Protocol>,
        seed: u64,
    ) -> Result<Self> {
        let times = prediction_times(data, settings.idelta, settings.tad);
        let predictions = PosteriorPredictive::calculate(
            summary,
            data,
            context,
            &times,
            settings.level,
            settings.draws,
            seed,
        )?;

        let readings: Vec<Reading> = context.observation.readings(data);
        let reading_times: Vec<f64> = readings.iter().map(|r| r.time).collect();
        let at_readings = PosteriorPredictive::calculate(
            summary,
            data,
            context,
            &reading_times,
            settings.level,
            settings.draws,
            seed,
        )?;
        let residuals = Residuals::new(&readings, &at_readings, &context.observation);
        let calibration = Calibration::new(&readings, &at_readings, &context.observation);

        let comparison = match protocol {
            Some(protocol) => Some(ProtocolComparison::new(summary, protocol, settings.level)?),
            None => None,
        };

        tracing::info!(
            "Residual RMSE {:.1} mg/dL, {:.1}% of readings inside the {:.0}% band",
            residuals.rmse(),
            100.0 * calibration.coverage(),
            100.0 * settings.level
        );

        Ok(Report {
            status: summary.status(),
            parameters: summary.parameter_summaries(),
            diagnostics: summary.diagnostics().clone(),
            predictions,
            residuals,
            calibration,
            comparison,
        })
    }

    /// Writes `predictions.csv` and, with a protocol, `comparison.csv`
    pub fn write(&self, folder: &str) -> Result<()> {
        self.predictions.write(folder)?;
        if let Some(comparison) = &self.comparison {
            comparison.write(folder)?;
        }
        Ok(())
    }
}

/// Regular grid from the first usable reading to `tad` hours past the last event
///
/// The grid starts where the free-running trajectory takes `initial_bg`: the first reading taken while the
/// delivered basal rate is known, or the first reading when there is no basal record.
pub fn prediction_times(data: &Data, idelta: f64, tad: f64) -> Vec<f64> {
    let start = data
        .first_known_reading()
        .unwrap_or_else(|| data.first_reading())
        .time;
    let (_, last) = data.span();
    let end = last + tad;
    let mut times = Vec::new();
    let mut i = 0usize;
    loop {
        let t = start + i as f64 * idelta;
        if t > end + 1e-9 {
            break;
        }
        times.push(t);
        i += 1;
    }
    if times.last().is_some_and(|t| *t < end - 1e-9) {
        times.push(end);
    }
    times
}

/// A result file in the output folder
///
/// The folder is created on demand and an existing file of the same name is replaced.
#[derive(Debug)]
pub struct OutputFile {
    file: File,
    path: PathBuf,
}

impl OutputFile {
    pub fn new(folder: &str, name: &str) -> Result<Self> {
        let path = Path::new(folder).join(name);
        if let Some(parent) = path.parent() {
            create_dir_all(parent)
                .with_context(|| format!("Failed to create the output folder {:?}", parent))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to open {:?} for writing", path))?;
        Ok(OutputFile { file, path })
    }

    /// A CSV writer whose first serialized row also writes the header
    pub fn csv(&self) -> csv::Writer<&File> {
        WriterBuilder::new().has_headers(true).from_writer(&self.file)
    }

    /// Serialize `rows` as CSV, one record per row
    pub fn write_rows<T: Serialize>(&self, rows: impl IntoIterator<Item = T>) -> Result<()> {
        let mut writer = self.csv();
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        tracing::debug!("Wrote {:?}", self.path);
        Ok(())
    }

    pub fn into_file(self) -> File {
        self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::ChainOutcome;
    use crate::structs::priors::Priors;

    fn chain(id: usize, draws: Array2<f64>, outcome: ChainOutcome) -> Chain {
        let n = draws.nrows();
        Chain {
            id,
            seed: id as u64,
            log_density: vec![-1.0; n],
            acceptance_rate: 0.3,
            restarts: 0,
            proposal_scales: vec![],
            draws,
            outcome,
        }
    }

    fn space() -> ParameterSpace {
        ParameterSpace::new(Layout::default(), &Priors::default(), 120.0).unwrap()
    }

    fn draws(offset: f64, n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, 7), |(i, j)| {
            let base = [1.0, 10.0, 50.0, 10.0, 0.02, 1.0, 120.0][j];
            base + offset + 0.01 * ((i * 7919 + j * 104729) % 97) as f64
        })
    }

    #[test]
    fn test_failed_chains_are_left_out() {
        let chains = vec![
            chain(0, draws(0.0, 40), ChainOutcome::Completed),
            chain(
                1,
                Array2::zeros((0, 7)),
                ChainOutcome::Failed(crate::algorithms::ChainFailure::NoFiniteStart {
                    attempts: 100,
                }),
            ),
        ];
        let summary = PosteriorSummary::new(&space(), chains, &Convergence::default());
        assert_eq!(summary.ndraws(), 40);
        assert_eq!(summary.draws().nrows(), 40);
        assert_eq!(summary.status(), Status::NotConverged);
        assert!(summary.complete());
    }

    #[test]
    fn test_all_failed() {
        let failure = ChainOutcome::Failed(crate::algorithms::ChainFailure::RetriesExhausted {
            restarts: 5,
        });
        let chains = vec![chain(0, Array2::zeros((0, 7)), failure)];
        let summary = PosteriorSummary::new(&space(), chains, &Convergence::default());
        assert_eq!(summary.status(), Status::Failed);
        assert!(summary.point_estimate().is_err());
    }

    #[test]
    fn test_cancelled_chain_marks_incomplete() {
        let chains = vec![
            chain(0, draws(0.0, 40), ChainOutcome::Completed),
            chain(1, draws(0.0, 1), ChainOutcome::Cancelled),
        ];
        let summary = PosteriorSummary::new(&space(), chains, &Convergence::default());
        assert_eq!(summary.status(), Status::Incomplete);
        assert!(!summary.complete());
        assert!(!summary.converged());
    }

    #[test]
    fn test_parameter_summaries() {
        let chains = vec![
            chain(0, draws(0.0, 200), ChainOutcome::Completed),
            chain(1, draws(0.0, 200), ChainOutcome::Completed),
        ];
        let summary = PosteriorSummary::new(&space(), chains, &Convergence::default());
        let rows = summary.parameter_summaries();
        assert_eq!(rows.len(), 7);
        assert_eq!(rows[0].name, "basal");
        for row in &rows {
            assert!(row.lower <= row.median && row.median <= row.upper);
            assert!(row.sd >= 0.0);
        }
        let estimate = summary.point_estimate().unwrap();
        assert!((estimate.basal[0] - rows[0].mean).abs() < 1e-12);
        assert_eq!(summary.parameter_draws("cf").unwrap().len(), 400);
        assert!(summary.parameter_draws("missing").is_none());
    }

    #[test]
    fn test_summary_is_written_as_csv() {
        let folder = std::env::temp_dir()
            .join(format!("bgcore-output-{}", std::process::id()))
            .join("nested");
        let folder = folder.to_string_lossy().to_string();
        let chains = vec![chain(0, draws(0.0, 20), ChainOutcome::Completed)];
        let summary = PosteriorSummary::new(&space(), chains, &Convergence::default());
        summary.write_summary(&folder).unwrap();
        summary.write_draws(&folder).unwrap();

        let written = std::fs::read_to_string(Path::new(&folder).join("summary.csv")).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 8);
        assert!(lines[0].starts_with("name,mean"));
        assert!(lines[0].contains("q2.5"));
        assert!(lines[1].starts_with("basal,"));

        let draws = std::fs::read_to_string(Path::new(&folder).join("draws.csv")).unwrap();
        assert_eq!(draws.lines().count(), 21);
        assert!(draws.starts_with("chain,draw,basal"));
    }

    #[test]
    fn test_prediction_times() {
        let data = Data::builder()
            .glucose(1.0, 100.0)
            .meal(2.0, 20.0)
            .glucose(3.1, 120.0)
            .build()
            .unwrap();
        let times = prediction_times(&data, 0.5, 0.0);
        assert_eq!(times.first(), Some(&1.0));
        assert_eq!(times.last(), Some(&3.1));
        assert!(times.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(times.len(), 6);
    }

    #[test]
    fn test_prediction_times_start_once_basal_is_known() {
        let data = Data::builder()
            .glucose(1.0, 100.0)
            .basal(2.0, 24.0)
            .glucose(3.0, 120.0)
            .glucose(4.0, 110.0)
            .build()
            .unwrap();
        let times = prediction_times(&data, 0.5, 0.0);
        assert_eq!(times, vec![3.0, 3.5, 4.0]);
    }
}
