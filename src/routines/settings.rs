use anyhow::{bail, Context as _, Result};
use config::Config as eConfig;
use serde::{Deserialize, Serialize};

use crate::algorithms::diagnostics::Convergence;
use crate::data::{Protocol, HOURS_PER_DAY};
use crate::routines::output::OutputFile;
use crate::simulator::kinetics::ProfileSet;
use crate::simulator::likelihood::ObservationModel;
use crate::simulator::{Anchor, Context, SimulationOptions};
use crate::structs::parameters::Layout;
use crate::structs::priors::Priors;

/// Contains all settings for bgcore
#[derive(Debug, Deserialize, Clone, Serialize, Default, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    /// General configuration of the sampler
    pub config: Config,
    /// Shape of the parameter vector
    pub parameters: Layout,
    /// Prior distributions of the parameters
    pub priors: Priors,
    /// Action profiles of insulin and carbohydrates
    pub kinetics: ProfileSet,
    /// Configuration of the forward simulation
    pub simulation: Simulation,
    /// The observation model
    pub observation: ObservationModel,
    /// Thresholds for the convergence diagnostics
    pub convergence: Convergence,
    /// Configuration for the posterior predictive
    pub predictions: Predictions,
    /// The prescribed protocol, if any
    pub protocol: ProtocolSettings,
    /// Configuration for logging
    pub log: Log,
    /// Configuration for the output files
    pub output: Output,
}

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::new()
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        self.parameters.validate()?;
        self.priors.validate()?;
        self.kinetics.validate()?;
        self.simulation.validate()?;
        self.observation.validate()?;
        self.convergence.validate()?;
        self.predictions.validate()?;
        self.protocol.validate()?;
        Ok(())
    }

    /// Kinetic, simulation and observation settings, as used by the sampler and the reports
    pub fn context(&self) -> Context {
        Context {
            profiles: self.kinetics.clone(),
            simulation: SimulationOptions {
                anchor: self.simulation.anchor,
                max_gap: self.simulation.max_gap,
            },
            observation: self.observation.clone(),
        }
    }
}

/// General configuration of the sampler
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Number of independent chains
    pub chains: usize,
    /// Iterations per chain after burn-in
    pub iterations: usize,
    /// Iterations per chain discarded while the proposal scales adapt
    pub burn_in: usize,
    /// Keep every `thin`-th iteration after burn-in
    pub thin: usize,
    /// Seed of the first chain, chain `k` uses `seed + k`
    pub seed: u64,
    /// Restarts from the prior a chain may make before it fails
    pub max_retries: usize,
    /// Consecutive non-finite proposals that trigger a restart
    pub max_divergent: usize,
    /// Acceptance rate targeted by the burn-in adaptation
    pub target_acceptance: f64,
    /// Iterations between two adaptations of the proposal scales
    pub adapt_interval: usize,
    /// Wall-clock limit for sampling, in seconds
    pub timeout: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chains: 4,
            iterations: 2000,
            burn_in: 1000,
            thin: 1,
            seed: 22,
            max_retries: 5,
            max_divergent: 100,
            target_acceptance: 0.3,
            adapt_interval: 50,
            timeout: None,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.chains == 0 {
            bail!("At least one chain is required");
        }
        if self.thin == 0 {
            bail!("Thinning must be at least 1");
        }
        if self.adapt_interval == 0 {
            bail!("The adaptation interval must be at least 1");
        }
        if self.max_divergent == 0 {
            bail!("The number of divergent proposals before a restart must be at least 1");
        }
        if !(self.target_acceptance > 0.0 && self.target_acceptance < 1.0) {
            bail!(
                "The target acceptance rate must be within (0, 1), got {}",
                self.target_acceptance
            );
        }
        if let Some(timeout) = self.timeout {
            if !(timeout.is_finite() && timeout >= 0.0) {
                bail!("The timeout must be non-negative, got {}", timeout);
            }
        }
        Ok(())
    }
}

/// Configuration of the forward simulation
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Simulation {
    pub anchor: Anchor,
    /// Hour of day at `time = 0`, overriding the one stored with the data
    pub clock_offset: Option<f64>,
    /// Hours without readings after which the free trajectory restarts from the next reading
    pub max_gap: f64,
}

impl Default for Simulation {
    fn default() -> Self {
        let options = SimulationOptions::default();
        Simulation {
            anchor: options.anchor,
            clock_offset: None,
            max_gap: options.max_gap,
        }
    }
}

impl Simulation {
    pub fn validate(&self) -> Result<()> {
        if !(self.max_gap > 0.0) {
            bail!("The maximum gap between readings must be positive, got {}", self.max_gap);
        }
        if let Some(offset) = self.clock_offset {
            if !(0.0..HOURS_PER_DAY).contains(&offset) {
                bail!("The clock offset must be within [0, 24), got {}", offset);
            }
        }
        Ok(())
    }
}

/// Configuration for the posterior predictive
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Predictions {
    /// Interval between prediction times, in hours
    pub idelta: f64,
    /// Hours predicted beyond the last event
    pub tad: f64,
    /// Probability mass of the credible band
    pub level: f64,
    /// Maximum number of posterior draws used
    pub draws: usize,
}

impl Default for Predictions {
    fn default() -> Self {
        Predictions {
            idelta: 0.25,
            tad: 0.0,
            level: 0.95,
            draws: 200,
        }
    }
}

impl Predictions {
    pub fn validate(&self) -> Result<()> {
        if !(self.idelta > 0.0) {
            bail!("The interval for predictions must be positive");
        }
        if self.tad < 0.0 {
            bail!("The time after the last event for predictions must be non-negative");
        }
        if !(self.level > 0.0 && self.level < 1.0) {
            bail!("The credible level must be within (0, 1), got {}", self.level);
        }
        if self.draws == 0 {
            bail!("At least one posterior draw is required for predictions");
        }
        Ok(())
    }
}

/// The prescribed protocol and how it informs the priors
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ProtocolSettings {
    pub prescribed: Option<Protocol>,
    /// Centre the basal, carbohydrate ratio and correction factor priors on the prescribed values
    pub centre_priors: bool,
    /// Log-scale standard deviation of the protocol-centred priors
    pub spread: f64,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        ProtocolSettings {
            prescribed: None,
            centre_priors: true,
            spread: 0.5,
        }
    }
}

impl ProtocolSettings {
    pub fn validate(&self) -> Result<()> {
        if let Some(protocol) = &self.prescribed {
            protocol.validate()?;
        }
        if !(self.spread.is_finite() && self.spread > 0.0) {
            bail!("The protocol spread must be positive, got {}", self.spread);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Log {
    /// The maximum log level to display
    ///
    /// One of `trace`, `debug`, `info`, `warn` or `error`.
    pub level: String,
    /// The file to write the log to, relative to the output folder
    pub file: String,
    /// Whether to write logs
    ///
    /// If set to `false`, a global subscriber will not be set by bgcore.
    pub write: bool,
}

impl Default for Log {
    fn default() -> Self {
        Log {
            level: String::from("info"),
            file: String::from("log.txt"),
            write: true,
        }
    }
}

/// Configuration for the output files
#[derive(Debug, Deserialize, Clone, Serialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct Output {
    /// Whether to write the output files
    pub write: bool,
    /// The (relative) path to write the output files to
    pub path: String,
}

impl Default for Output {
    fn default() -> Self {
        Output {
            write: false,
            path: String::from("outputs/"),
        }
    }
}

impl Output {
    /// Parses the output folder location
    ///
    /// A single `#` in the path is replaced by the lowest number that gives a folder which does not exist yet.
    pub fn parse_output_folder(&mut self) -> Result<()> {
        if self.path.is_empty() {
            self.path = Output::default().path;
        }

        match self.path.matches('#').count() {
            0 => Ok(()),
            1 => {
                let mut num = 1;
                while std::path::Path::new(&self.path.replace('#', &num.to_string())).exists() {
                    num += 1;
                }
                self.path = self.path.replace('#', &num.to_string());
                Ok(())
            }
            _ => bail!("Only one `#` symbol is allowed in the output folder path"),
        }
    }
}

/// Builds [Settings] programmatically, validating on [SettingsBuilder::build]
#[derive(Debug, Clone, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: Config) -> Self {
        self.settings.config = config;
        self
    }

    pub fn layout(mut self, layout: Layout) -> Self {
        self.settings.parameters = layout;
        self
    }

    pub fn priors(mut self, priors: Priors) -> Self {
        self.settings.priors = priors;
        self
    }

    pub fn kinetics(mut self, kinetics: ProfileSet) -> Self {
        self.settings.kinetics = kinetics;
        self
    }

    pub fn simulation(mut self, simulation: Simulation) -> Self {
        self.settings.simulation = simulation;
        self
    }

    pub fn observation(mut self, observation: ObservationModel) -> Self {
        self.settings.observation = observation;
        self
    }

    pub fn convergence(mut self, convergence: Convergence) -> Self {
        self.settings.convergence = convergence;
        self
    }

    pub fn predictions(mut self, predictions: Predictions) -> Self {
        self.settings.predictions = predictions;
        self
    }

    /// Compare against `protocol`, centring the priors on it with log-scale spread `spread`
    pub fn protocol(mut self, protocol: Protocol, spread: f64) -> Self {
        self.settings.protocol = ProtocolSettings {
            prescribed: Some(protocol),
            centre_priors: true,
            spread,
        };
        self
    }

    pub fn log(mut self, log: Log) -> Self {
        self.settings.log = log;
        self
    }

    pub fn output(mut self, output: Output) -> Self {
        self.settings.output = output;
        self
    }

    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

/// Parses the settings from a TOML configuration file
///
/// The settings are validated, and a copy is written to the output folder if output is enabled.
///
/// Entries in the TOML file may be overridden by environment variables prefixed with `BGCORE_`, using a single
/// underscore as the separator for nested entries. For example, `BGCORE_CONFIG_CHAINS=8` sets `config.chains`.
pub fn read(path: impl Into<String>) -> Result<Settings> {
    let settings_path = path.into();

    let parsed = eConfig::builder()
        .add_source(config::File::with_name(&settings_path).format(config::FileFormat::Toml))
        .add_source(config::Environment::with_prefix("BGCORE").separator("_"))
        .build()
        .with_context(|| format!("Unable to read settings from {}", settings_path))?;

    let mut settings: Settings = parsed.try_deserialize()?;

    settings.validate()?;
    settings.output.parse_output_folder()?;

    if settings.output.write {
        if let Err(error) = write_settings_to_file(&settings) {
            bail!("Could not write settings to file: {}", error);
        }
    }

    Ok(settings)
}

/// Writes a copy of the parsed settings to `settings.json` in the output folder
pub fn write_settings_to_file(settings: &Settings) -> Result<()> {
    let serialized = serde_json::to_string_pretty(settings)?;
    let outputfile = OutputFile::new(settings.output.path.as_str(), "settings.json")?;
    let mut file = outputfile.into_file();
    std::io::Write::write_all(&mut file, serialized.as_bytes())?;
    Ok(())
}
