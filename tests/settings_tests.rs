use anyhow::Result;
use bgcore::prelude::*;
use std::path::PathBuf;

fn write_toml(name: &str, contents: &str) -> Result<PathBuf> {
    let folder = std::env::temp_dir().join(format!("bgcore-settings-{}", std::process::id()));
    std::fs::create_dir_all(&folder)?;
    let path = folder.join(name);
    std::fs::write(&path, contents)?;
    Ok(path)
}

/// Test basic Settings builder construction
#[test]
fn test_settings_builder_basic() -> Result<()> {
    let settings = Settings::builder()
        .config(Config {
            chains: 2,
            iterations: 500,
            ..Config::default()
        })
        .layout(Layout {
            basal_blocks: 4,
            meal_slot_ratios: true,
            day_night_factors: false,
        })
        .build()?;

    assert_eq!(settings.config.chains, 2);
    assert_eq!(settings.config.burn_in, 1000);
    assert_eq!(settings.parameters.len(), 4 + 5 + 1 + 4);
    assert_eq!(settings.observation.lookback, 2.0);
    assert_eq!(settings.simulation.max_gap, 16.0);
    assert!(!settings.output.write);
    Ok(())
}

/// Invalid sections are rejected when building
#[test]
fn test_settings_builder_validates() -> Result<()> {
    let zero_chains = Settings::builder()
        .config(Config {
            chains: 0,
            ..Config::default()
        })
        .build();
    assert!(zero_chains.is_err());

    let bad_protocol = Settings::builder()
        .protocol(Protocol::uniform(1.0, 0.0, 50.0), 0.5)
        .build();
    assert!(bad_protocol.is_err());

    let bad_level = Settings::builder()
        .predictions(settings::Predictions {
            level: 1.5,
            ..Default::default()
        })
        .build();
    assert!(bad_level.is_err());
    Ok(())
}

/// Test Settings serialization to JSON
#[test]
fn test_settings_serialization() -> Result<()> {
    let settings = Settings::builder()
        .protocol(Protocol::uniform(0.9, 11.0, 45.0), 0.3)
        .build()?;

    let json = serde_json::to_string(&settings)?;
    assert!(json.contains("\"config\""));
    assert!(json.contains("\"priors\""));

    let deserialized: Settings = serde_json::from_str(&json)?;
    assert_eq!(deserialized, settings);
    Ok(())
}

/// Sections and fields missing from the file keep their defaults, environment variables override the file
#[test]
fn test_read_toml() -> Result<()> {
    let path = write_toml(
        "settings.toml",
        r#"
[config]
chains = 3
iterations = 800
seed = 7

[parameters]
basal_blocks = 2
day_night_factors = true

[priors.carb_ratio]
distribution = "lognormal"
median = 12.0
sigma = 0.4

[priors.outlier_prob]
distribution = "beta"
alpha = 1.0
beta = 50.0

[kinetics.meal]
shape = "linear"
peak = 1.0
duration = 4.0

[observation]
lookback = 1.5
outlier_handling = "mixture"

[simulation]
anchor = "readings"
clock_offset = 7.0
max_gap = 12.0

[log]
write = false
"#,
    )?;
    let path = path.to_string_lossy().to_string();

    let settings = settings::read(path.clone())?;
    assert_eq!(settings.config.chains, 3);
    assert_eq!(settings.config.iterations, 800);
    assert_eq!(settings.config.seed, 7);
    assert_eq!(settings.config.burn_in, Config::default().burn_in);
    assert_eq!(settings.parameters.basal_blocks, 2);
    assert!(settings.parameters.day_night_factors);
    assert_eq!(
        settings.priors.carb_ratio,
        Prior::LogNormal {
            median: 12.0,
            sigma: 0.4
        }
    );
    assert_eq!(
        settings.priors.outlier_prob,
        Prior::Beta {
            alpha: 1.0,
            beta: 50.0
        }
    );
    assert_eq!(settings.kinetics.meal.duration, 4.0);
    assert_eq!(settings.kinetics.insulin, ProfileSet::default().insulin);
    assert_eq!(settings.observation.lookback, 1.5);
    assert_eq!(settings.observation.outlier_handling, OutlierHandling::Mixture);
    assert_eq!(settings.simulation.anchor, Anchor::Readings);
    assert_eq!(settings.simulation.clock_offset, Some(7.0));
    assert_eq!(settings.context().simulation.max_gap, 12.0);

    std::env::set_var("BGCORE_CONFIG_CHAINS", "8");
    let overridden = settings::read(path);
    std::env::remove_var("BGCORE_CONFIG_CHAINS");
    assert_eq!(overridden?.config.chains, 8);
    Ok(())
}

#[test]
fn test_read_rejects_unknown_fields() -> Result<()> {
    let path = write_toml(
        "unknown.toml",
        r#"
[config]
chains = 2
cycles = 100
"#,
    )?;
    assert!(settings::read(path.to_string_lossy().to_string()).is_err());
    Ok(())
}

#[test]
fn test_read_rejects_invalid_values() -> Result<()> {
    let path = write_toml(
        "invalid.toml",
        r#"
[simulation]
clock_offset = 25.0
"#,
    )?;
    assert!(settings::read(path.to_string_lossy().to_string()).is_err());
    Ok(())
}

#[test]
fn test_parse_output_folder() -> Result<()> {
    let base = std::env::temp_dir().join(format!("bgcore-output-{}", std::process::id()));
    std::fs::create_dir_all(base.join("run_1"))?;

    let mut output = settings::Output {
        write: true,
        path: base.join("run_#").to_string_lossy().to_string(),
    };
    output.parse_output_folder()?;
    assert_eq!(output.path, base.join("run_2").to_string_lossy().to_string());

    let mut twice = settings::Output {
        write: true,
        path: "a#/b#".to_string(),
    };
    assert!(twice.parse_output_folder().is_err());
    Ok(())
}
