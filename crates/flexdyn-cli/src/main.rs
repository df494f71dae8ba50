use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

use flexdyn_runner::{Properties, RunReport};

#[derive(Parser)]
#[command(name = "flexdyn", version, about = "Protein flexibility ensemble tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive geometric bounds from a structure (Concoord dist)
    ConcoordDist {
        #[arg(long = "input_structure_path")]
        input_structure_path: PathBuf,
        #[arg(long = "output_pdb_path")]
        output_pdb_path: PathBuf,
        #[arg(long = "output_gro_path")]
        output_gro_path: PathBuf,
        #[arg(long = "output_dat_path")]
        output_dat_path: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Generate structures satisfying the bounds (Concoord disco)
    ConcoordDisco {
        #[arg(long = "input_pdb_path")]
        input_pdb_path: PathBuf,
        #[arg(long = "input_dat_path")]
        input_dat_path: PathBuf,
        #[arg(long = "output_traj_path")]
        output_traj_path: PathBuf,
        #[arg(long = "output_rmsd_path")]
        output_rmsd_path: PathBuf,
        #[arg(long = "output_bfactor_path")]
        output_bfactor_path: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Compute internal-coordinate normal modes (iMODS imode)
    ImodImode {
        #[arg(long = "input_pdb_path")]
        input_pdb_path: PathBuf,
        #[arg(long = "output_dat_path")]
        output_dat_path: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Animate a structure along one mode (iMODS imove)
    ImodImove {
        #[arg(long = "input_pdb_path")]
        input_pdb_path: PathBuf,
        #[arg(long = "input_dat_path")]
        input_dat_path: PathBuf,
        #[arg(long = "output_pdb_path")]
        output_pdb_path: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Sample an ensemble by Monte Carlo over the modes (iMODS imc)
    ImodImc {
        #[arg(long = "input_pdb_path")]
        input_pdb_path: PathBuf,
        #[arg(long = "input_dat_path")]
        input_dat_path: PathBuf,
        #[arg(long = "output_traj_path")]
        output_traj_path: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Generate decoys with non-linear rigid-block NMA (NOLB)
    NolbNma {
        #[arg(long = "input_pdb_path")]
        input_pdb_path: PathBuf,
        #[arg(long = "output_pdb_path")]
        output_pdb_path: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Sample an anisotropic-network-model ensemble (built in)
    AnmEnsemble {
        #[arg(long = "input_pdb_path")]
        input_pdb_path: PathBuf,
        #[arg(long = "output_pdb_path")]
        output_pdb_path: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => emit_json(&payload),
        Ok(None) => {}
        Err(err) => {
            let code = err
                .downcast_ref::<flexdyn_core::Error>()
                .map(|e| e.exit_status())
                .unwrap_or(1);
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string()));
            } else {
                eprintln!("error: {}", err);
            }
            std::process::exit(code);
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::ConcoordDist {
            input_structure_path,
            output_pdb_path,
            output_gro_path,
            output_dat_path,
            config,
            json,
        } => {
            let props = load_properties(config.as_deref())?;
            let report = flexdyn_runner::concoord_dist(
                &input_structure_path,
                &output_pdb_path,
                &output_gro_path,
                &output_dat_path,
                &props,
            )?;
            Ok(render_report(report, json)?)
        }
        Commands::ConcoordDisco {
            input_pdb_path,
            input_dat_path,
            output_traj_path,
            output_rmsd_path,
            output_bfactor_path,
            config,
            json,
        } => {
            let mut props = load_properties(config.as_deref())?;
            // CONCOORDLIB is how Concoord installations advertise their
            // parameter library; an explicit property wins over it.
            if !props.contains_key("parameter_library_path") {
                if let Ok(lib) = std::env::var("CONCOORDLIB") {
                    props.insert("parameter_library_path".to_string(), Value::String(lib));
                }
            }
            let report = flexdyn_runner::concoord_disco(
                &input_pdb_path,
                &input_dat_path,
                &output_traj_path,
                &output_rmsd_path,
                &output_bfactor_path,
                &props,
            )?;
            Ok(render_report(report, json)?)
        }
        Commands::ImodImode {
            input_pdb_path,
            output_dat_path,
            config,
            json,
        } => {
            let props = load_properties(config.as_deref())?;
            let report =
                flexdyn_runner::imod_imode(&input_pdb_path, &output_dat_path, &props)?;
            Ok(render_report(report, json)?)
        }
        Commands::ImodImove {
            input_pdb_path,
            input_dat_path,
            output_pdb_path,
            config,
            json,
        } => {
            let props = load_properties(config.as_deref())?;
            let report = flexdyn_runner::imod_imove(
                &input_pdb_path,
                &input_dat_path,
                &output_pdb_path,
                &props,
            )?;
            Ok(render_report(report, json)?)
        }
        Commands::ImodImc {
            input_pdb_path,
            input_dat_path,
            output_traj_path,
            config,
            json,
        } => {
            let props = load_properties(config.as_deref())?;
            let report = flexdyn_runner::imod_imc(
                &input_pdb_path,
                &input_dat_path,
                &output_traj_path,
                &props,
            )?;
            Ok(render_report(report, json)?)
        }
        Commands::NolbNma {
            input_pdb_path,
            output_pdb_path,
            config,
            json,
        } => {
            let props = load_properties(config.as_deref())?;
            let report = flexdyn_runner::nolb_nma(&input_pdb_path, &output_pdb_path, &props)?;
            Ok(render_report(report, json)?)
        }
        Commands::AnmEnsemble {
            input_pdb_path,
            output_pdb_path,
            config,
            json,
        } => {
            let props = load_properties(config.as_deref())?;
            let report =
                flexdyn_runner::anm_ensemble(&input_pdb_path, &output_pdb_path, &props)?;
            Ok(render_report(report, json)?)
        }
    }
}

/// Load tool properties from a YAML or JSON file. The mapping may sit
/// at the top level or under a `properties` key, matching the layout
/// of typical workflow configuration files.
fn load_properties(config: Option<&Path>) -> Result<Properties> {
    let Some(path) = config else {
        return Ok(Properties::new());
    };
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("cannot read config {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let value: Value = if is_json {
        serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("invalid JSON config {}: {}", path.display(), e))?
    } else {
        serde_yaml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("invalid YAML config {}: {}", path.display(), e))?
    };
    let mapping = match value {
        Value::Object(map) => {
            if let Some(Value::Object(inner)) = map.get("properties") {
                inner.clone()
            } else {
                map
            }
        }
        other => {
            return Err(anyhow::anyhow!(
                "config {} must be a mapping, got {}",
                path.display(),
                other
            ))
        }
    };
    Ok(mapping.into_iter().collect())
}

fn render_report(report: RunReport, json: bool) -> Result<Option<Value>> {
    if json {
        let payload = serde_json::to_value(&report)?;
        return Ok(Some(json!({ "ok": true, "report": payload })));
    }
    println!("tool: {}", report.tool);
    println!("skipped: {}", report.skipped);
    println!("exit_status: {}", report.exit_status);
    for output in &report.outputs {
        println!("output: {}", output.display());
    }
    if let Some(dir) = &report.workdir_retained {
        println!("workdir_retained: {}", dir.display());
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::ConcoordDist { json, .. }
        | Commands::ConcoordDisco { json, .. }
        | Commands::ImodImode { json, .. }
        | Commands::ImodImove { json, .. }
        | Commands::ImodImc { json, .. }
        | Commands::NolbNma { json, .. }
        | Commands::AnmEnsemble { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "flexdyn_cli_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp root");
        dir
    }

    #[test]
    fn yaml_config_maps_straight_to_properties() {
        let root = temp_root("yaml");
        let path = root.join("props.yml");
        fs::write(&path, "num_structs: 20\ncutoff: 5.0\nrestart: true\n").expect("write");
        let props = load_properties(Some(&path)).expect("load");
        assert_eq!(props.get("num_structs"), Some(&Value::from(20)));
        assert_eq!(props.get("cutoff"), Some(&Value::from(5.0)));
        assert_eq!(props.get("restart"), Some(&Value::from(true)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn nested_properties_key_is_unwrapped() {
        let root = temp_root("nested");
        let path = root.join("props.json");
        fs::write(
            &path,
            r#"{"properties": {"vdw": 2, "bond_angle": 1}, "other": "ignored"}"#,
        )
        .expect("write");
        let props = load_properties(Some(&path)).expect("load");
        assert_eq!(props.get("vdw"), Some(&Value::from(2)));
        assert_eq!(props.get("bond_angle"), Some(&Value::from(1)));
        assert!(!props.contains_key("other"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn non_mapping_config_is_rejected() {
        let root = temp_root("scalar");
        let path = root.join("props.yml");
        fs::write(&path, "- just\n- a\n- list\n").expect("write");
        assert!(load_properties(Some(&path)).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_config_means_empty_properties() {
        let props = load_properties(None).expect("load");
        assert!(props.is_empty());
    }
}
