//! The seven tool definitions: property schemas, staging modes,
//! argument-vector layouts and artifact tables, each expressed against
//! the shared engine in the crate root.
//!
//! The flag tables mirror the wrapped binaries' CLI grammars exactly;
//! those grammars (positional order, output-naming conventions,
//! path-length tolerance) are fixed external contracts.

use std::path::{Path, PathBuf};

use flexdyn_core::{copy_into, Error, Result};

use crate::{
    run_tool, Artifact, Computation, Constraint, FlagSpec, InputFile, OutputFile, Plan, PropDef,
    PropKind, PropValue, Properties, ResolvedProps, RunReport, Staged, StagingMode, ToolRun,
    push_optional_flags, resolve_properties,
};

use flexdyn_anm::{AnmParameters, Selection};

const fn int_prop(key: &'static str, default: i64) -> PropDef {
    PropDef::new(key, PropKind::Int, Some(PropValue::Int(default)), Constraint::Free)
}

const fn int_opt(key: &'static str) -> PropDef {
    PropDef::new(key, PropKind::Int, None, Constraint::Free)
}

const fn float_prop(key: &'static str, default: f64) -> PropDef {
    PropDef::new(key, PropKind::Float, Some(PropValue::Float(default)), Constraint::Free)
}

const fn float_opt(key: &'static str) -> PropDef {
    PropDef::new(key, PropKind::Float, None, Constraint::Free)
}

const fn bool_prop(key: &'static str, default: bool) -> PropDef {
    PropDef::new(key, PropKind::Bool, Some(PropValue::Bool(default)), Constraint::Free)
}

const fn bool_opt(key: &'static str) -> PropDef {
    PropDef::new(key, PropKind::Bool, None, Constraint::Free)
}

const fn text_opt(key: &'static str) -> PropDef {
    PropDef::new(key, PropKind::Text, None, Constraint::Free)
}

fn file_ext(name: &str) -> &str {
    Path::new(name).extension().and_then(|e| e.to_str()).unwrap_or("")
}

// ---------------------------------------------------------------------------
// Concoord dist
// ---------------------------------------------------------------------------

static DIST_SCHEMA: &[PropDef] = &[
    text_opt("binary_path"),
    PropDef::new("vdw", PropKind::Int, Some(PropValue::Int(1)), Constraint::IntRange(1, 6)),
    PropDef::new(
        "bond_angle",
        PropKind::Int,
        Some(PropValue::Int(1)),
        Constraint::IntRange(1, 2),
    ),
    bool_prop("retain_hydrogens", false),
    bool_prop("nb_interactions", false),
    bool_prop("fixed_atoms", false),
    float_prop("cutoff", 4.0),
    PropDef::new(
        "min_distances",
        PropKind::Int,
        Some(PropValue::Int(50)),
        Constraint::MinInt(0),
    ),
    float_prop("damp", 1.0),
];

static DIST_FLAGS: &[FlagSpec] = &[
    FlagSpec::bare("retain_hydrogens", "-r"),
    FlagSpec::bare("nb_interactions", "-nb"),
    FlagSpec::bare("fixed_atoms", "-q"),
    FlagSpec::valued("cutoff", "-c"),
    FlagSpec::valued("min_distances", "-m"),
    FlagSpec::valued("damp", "-damp"),
];

fn dist_plan(props: &ResolvedProps, staged: &Staged) -> Result<Plan> {
    let binary = props.text("binary_path").unwrap_or("dist").to_string();
    let mut argv = vec![
        binary,
        "-op".to_string(),
        staged.output("output_pdb_path").to_string(),
        "-og".to_string(),
        staged.output("output_gro_path").to_string(),
        "-od".to_string(),
        staged.output("output_dat_path").to_string(),
    ];

    let input = staged.input("input_structure_path").to_string();
    let input_flag = match file_ext(&input) {
        "pdb" => "-p",
        "gro" => "-g",
        other => {
            return Err(Error::config(format!(
                "concoord_dist: input structure must be a PDB or GRO file (got '.{}')",
                other
            )))
        }
    };
    argv.push(input_flag.to_string());
    argv.push(input);

    push_optional_flags(&mut argv, props, DIST_FLAGS);

    // dist asks for the VdW and bond/angle parameter sets on stdin.
    let vdw = props.int("vdw").unwrap_or(1);
    let bond_angle = props.int("bond_angle").unwrap_or(1);

    Ok(Plan {
        computation: Computation::Subprocess {
            argv,
            stdin_feed: Some(format!("{}\n{}\n", vdw, bond_angle)),
        },
        artifacts: vec![
            Artifact {
                staged_name: staged.output("output_pdb_path").to_string(),
                role: "output_pdb_path",
            },
            Artifact {
                staged_name: staged.output("output_gro_path").to_string(),
                role: "output_gro_path",
            },
            Artifact {
                staged_name: staged.output("output_dat_path").to_string(),
                role: "output_dat_path",
            },
        ],
    })
}

/// Structure interpretation and bond definitions from a PDB/GRO file
/// (Concoord `dist`).
pub fn concoord_dist(
    input_structure_path: &Path,
    output_pdb_path: &Path,
    output_gro_path: &Path,
    output_dat_path: &Path,
    properties: &Properties,
) -> Result<RunReport> {
    let props = resolve_properties("concoord_dist", DIST_SCHEMA, properties)?;
    let remove_tmp = props.remove_tmp;
    let restart = props.restart;
    run_tool(ToolRun {
        tool: "concoord_dist",
        staging: StagingMode::Relative,
        inputs: vec![InputFile {
            role: "input_structure_path",
            source: input_structure_path.to_path_buf(),
            accepted: &["pdb", "gro"],
        }],
        outputs: vec![
            OutputFile {
                role: "output_pdb_path",
                dest: output_pdb_path.to_path_buf(),
                accepted: &["pdb"],
            },
            OutputFile {
                role: "output_gro_path",
                dest: output_gro_path.to_path_buf(),
                accepted: &["gro"],
            },
            OutputFile {
                role: "output_dat_path",
                dest: output_dat_path.to_path_buf(),
                accepted: &["dat", "txt"],
            },
        ],
        remove_tmp,
        restart,
        build: Box::new(move |staged| dist_plan(&props, staged)),
    })
}

// ---------------------------------------------------------------------------
// Concoord disco
// ---------------------------------------------------------------------------

/// Parameter-set names indexed by the `vdw` property (1-based).
pub const VDW_PARAMETER_SETS: [&str; 6] = ["oplsua", "oplsaa", "repel", "yamber2", "li", "oplsx"];

static DISCO_SCHEMA: &[PropDef] = &[
    text_opt("binary_path"),
    text_opt("parameter_library_path"),
    PropDef::new("vdw", PropKind::Int, Some(PropValue::Int(1)), Constraint::IntRange(1, 6)),
    int_opt("num_structs"),
    int_opt("num_iterations"),
    PropDef::new("chirality_check", PropKind::Int, None, Constraint::IntRange(0, 2)),
    int_opt("bs"),
    float_opt("cutoff"),
    int_opt("seed"),
    float_opt("damp"),
    float_opt("violation"),
    int_opt("convergence"),
    int_opt("trials"),
    int_opt("dyn"),
    int_opt("pairlist_freq"),
    int_opt("scale"),
    bool_opt("nofit"),
    bool_opt("bump"),
    bool_opt("ref"),
];

static DISCO_FLAGS: &[FlagSpec] = &[
    FlagSpec::valued("num_structs", "-n"),
    FlagSpec::valued("num_iterations", "-i"),
    FlagSpec::valued("chirality_check", "-c"),
    FlagSpec::valued("bs", "-bs"),
    FlagSpec::valued("cutoff", "-rc"),
    FlagSpec::valued("seed", "-s"),
    FlagSpec::valued("damp", "-damp"),
    FlagSpec::valued("violation", "-viol"),
    FlagSpec::valued("convergence", "-con"),
    FlagSpec::valued("trials", "-t"),
    FlagSpec::valued("dyn", "-dyn"),
    FlagSpec::valued("pairlist_freq", "-l"),
    FlagSpec::valued("scale", "-is"),
    FlagSpec::bare("nofit", "-f"),
    FlagSpec::bare("bump", "-bump"),
    FlagSpec::bare("ref", "-ref"),
];

/// Stage the Concoord parameter library (margins, atom and bond
/// tables) into the working directory under the fixed names the
/// binary expects.
fn stage_concoord_library(library: &Path, vdw: i64, workdir: &Path) -> Result<()> {
    let set = VDW_PARAMETER_SETS[(vdw - 1) as usize];
    copy_into(
        &library.join(format!("MARGINS_{}.DAT", set)),
        workdir,
        "MARGINS.DAT",
    )?;
    copy_into(
        &library.join(format!("ATOMS_{}.DAT", set)),
        workdir,
        "ATOMS.DAT",
    )?;
    copy_into(&library.join("BONDS.DAT"), workdir, "BONDS.DAT")?;
    Ok(())
}

fn disco_plan(props: &ResolvedProps, library: &Path, staged: &Staged) -> Result<Plan> {
    let vdw = props.int("vdw").unwrap_or(1);
    stage_concoord_library(library, vdw, &staged.dir)?;

    let binary = props.text("binary_path").unwrap_or("disco").to_string();
    let mut argv = vec![
        binary,
        "-p".to_string(),
        staged.input("input_pdb_path").to_string(),
        "-d".to_string(),
        staged.input("input_dat_path").to_string(),
        "-or".to_string(),
        staged.output("output_rmsd_path").to_string(),
        "-of".to_string(),
        staged.output("output_bfactor_path").to_string(),
    ];

    let traj = staged.output("output_traj_path").to_string();
    let mode_flag = match file_ext(&traj) {
        // multi-model NMR-style PDB
        "pdb" => "-on",
        "gro" => "-ot",
        "xtc" => "-ox",
        other => {
            return Err(Error::config(format!(
                "concoord_disco: output trajectory must be a PDB, GRO or XTC file (got '.{}')",
                other
            )))
        }
    };
    argv.push(mode_flag.to_string());
    argv.push(traj);

    push_optional_flags(&mut argv, props, DISCO_FLAGS);

    Ok(Plan {
        computation: Computation::Subprocess {
            argv,
            stdin_feed: None,
        },
        artifacts: vec![
            Artifact {
                staged_name: staged.output("output_traj_path").to_string(),
                role: "output_traj_path",
            },
            Artifact {
                staged_name: staged.output("output_rmsd_path").to_string(),
                role: "output_rmsd_path",
            },
            Artifact {
                staged_name: staged.output("output_bfactor_path").to_string(),
                role: "output_bfactor_path",
            },
        ],
    })
}

/// Structure generation from the geometric constraints extracted by
/// `dist` (Concoord `disco`). The parameter library directory must be
/// provided via the `parameter_library_path` property; the CLI layer
/// resolves `$CONCOORDLIB` into it.
pub fn concoord_disco(
    input_pdb_path: &Path,
    input_dat_path: &Path,
    output_traj_path: &Path,
    output_rmsd_path: &Path,
    output_bfactor_path: &Path,
    properties: &Properties,
) -> Result<RunReport> {
    let props = resolve_properties("concoord_disco", DISCO_SCHEMA, properties)?;
    let library = props
        .text("parameter_library_path")
        .map(PathBuf::from)
        .ok_or_else(|| {
            Error::staging(
                "concoord_disco: parameter library directory not configured \
                 (set 'parameter_library_path', or export CONCOORDLIB when using the CLI)",
            )
        })?;
    if !library.is_dir() {
        return Err(Error::staging(format!(
            "concoord_disco: parameter library directory not found: {}",
            library.display()
        )));
    }
    let remove_tmp = props.remove_tmp;
    let restart = props.restart;
    run_tool(ToolRun {
        tool: "concoord_disco",
        staging: StagingMode::Relative,
        inputs: vec![
            InputFile {
                role: "input_pdb_path",
                source: input_pdb_path.to_path_buf(),
                accepted: &["pdb"],
            },
            InputFile {
                role: "input_dat_path",
                source: input_dat_path.to_path_buf(),
                accepted: &["dat", "txt"],
            },
        ],
        outputs: vec![
            OutputFile {
                role: "output_traj_path",
                dest: output_traj_path.to_path_buf(),
                accepted: &["pdb", "gro", "xtc"],
            },
            OutputFile {
                role: "output_rmsd_path",
                dest: output_rmsd_path.to_path_buf(),
                accepted: &["dat"],
            },
            OutputFile {
                role: "output_bfactor_path",
                dest: output_bfactor_path.to_path_buf(),
                accepted: &["pdb"],
            },
        ],
        remove_tmp,
        restart,
        build: Box::new(move |staged| disco_plan(&props, &library, staged)),
    })
}

// ---------------------------------------------------------------------------
// iMODS imode
// ---------------------------------------------------------------------------

/// Fixed prefix handed to `imode`; the binary derives its own artifact
/// names from it.
const IMODE_PREFIX: &str = "imods_evecs";
const IMODE_ARTIFACT: &str = "imods_evecs_ic.evec";

static IMODE_SCHEMA: &[PropDef] = &[
    text_opt("binary_path"),
    PropDef::new("cg", PropKind::Int, Some(PropValue::Int(2)), Constraint::IntRange(0, 2)),
];

fn imode_plan(props: &ResolvedProps, staged: &Staged) -> Result<Plan> {
    let binary = props.text("binary_path").unwrap_or("imode_gcc").to_string();
    let cg = props.int("cg").unwrap_or(2);
    let argv = vec![
        binary,
        staged.input("input_pdb_path").to_string(),
        "-o".to_string(),
        IMODE_PREFIX.to_string(),
        "-m".to_string(),
        cg.to_string(),
    ];
    Ok(Plan {
        computation: Computation::Subprocess {
            argv,
            stdin_feed: None,
        },
        artifacts: vec![Artifact {
            staged_name: IMODE_ARTIFACT.to_string(),
            role: "output_dat_path",
        }],
    })
}

/// Normal-mode computation (iMODS `imode`).
pub fn imod_imode(
    input_pdb_path: &Path,
    output_dat_path: &Path,
    properties: &Properties,
) -> Result<RunReport> {
    let props = resolve_properties("imod_imode", IMODE_SCHEMA, properties)?;
    let remove_tmp = props.remove_tmp;
    let restart = props.restart;
    run_tool(ToolRun {
        tool: "imod_imode",
        staging: StagingMode::Sandbox,
        inputs: vec![InputFile {
            role: "input_pdb_path",
            source: input_pdb_path.to_path_buf(),
            accepted: &["pdb"],
        }],
        outputs: vec![OutputFile {
            role: "output_dat_path",
            dest: output_dat_path.to_path_buf(),
            accepted: &["dat", "txt"],
        }],
        remove_tmp,
        restart,
        build: Box::new(move |staged| imode_plan(&props, staged)),
    })
}

// ---------------------------------------------------------------------------
// iMODS imove
// ---------------------------------------------------------------------------

static IMOVE_SCHEMA: &[PropDef] = &[
    text_opt("binary_path"),
    PropDef::new("pc", PropKind::Int, Some(PropValue::Int(1)), Constraint::MinInt(1)),
    int_prop("num_frames", 11),
];

static IMOVE_FLAGS: &[FlagSpec] = &[FlagSpec::valued("num_frames", "-c")];

fn imove_plan(props: &ResolvedProps, staged: &Staged) -> Result<Plan> {
    let binary = props.text("binary_path").unwrap_or("imove").to_string();
    let pc = props.int("pc").unwrap_or(1);
    // positional grammar: structure, eigenvectors, output, PC index
    let mut argv = vec![
        binary,
        staged.input("input_pdb_path").to_string(),
        staged.input("input_dat_path").to_string(),
        staged.output("output_pdb_path").to_string(),
        pc.to_string(),
    ];
    push_optional_flags(&mut argv, props, IMOVE_FLAGS);
    Ok(Plan {
        computation: Computation::Subprocess {
            argv,
            stdin_feed: None,
        },
        artifacts: vec![Artifact {
            staged_name: staged.output("output_pdb_path").to_string(),
            role: "output_pdb_path",
        }],
    })
}

/// Normal-mode animation along one principal component (iMODS
/// `imove`).
pub fn imod_imove(
    input_pdb_path: &Path,
    input_dat_path: &Path,
    output_pdb_path: &Path,
    properties: &Properties,
) -> Result<RunReport> {
    let props = resolve_properties("imod_imove", IMOVE_SCHEMA, properties)?;
    let remove_tmp = props.remove_tmp;
    let restart = props.restart;
    run_tool(ToolRun {
        tool: "imod_imove",
        staging: StagingMode::Sandbox,
        inputs: vec![
            InputFile {
                role: "input_pdb_path",
                source: input_pdb_path.to_path_buf(),
                accepted: &["pdb"],
            },
            InputFile {
                role: "input_dat_path",
                source: input_dat_path.to_path_buf(),
                accepted: &["dat", "txt"],
            },
        ],
        outputs: vec![OutputFile {
            role: "output_pdb_path",
            dest: output_pdb_path.to_path_buf(),
            accepted: &["pdb"],
        }],
        remove_tmp,
        restart,
        build: Box::new(move |staged| imove_plan(&props, staged)),
    })
}

// ---------------------------------------------------------------------------
// iMODS imc
// ---------------------------------------------------------------------------

/// `imc` appends `.pdb` to the prefix it is given.
const IMC_PREFIX: &str = "imod_ensemble";
const IMC_ARTIFACT: &str = "imod_ensemble.pdb";

static IMC_SCHEMA: &[PropDef] = &[
    text_opt("binary_path"),
    PropDef::new(
        "num_structs",
        PropKind::Int,
        Some(PropValue::Int(500)),
        Constraint::MinInt(0),
    ),
    PropDef::new("num_modes", PropKind::Int, Some(PropValue::Int(5)), Constraint::MinInt(0)),
    float_prop("amplitude", 1.0),
];

static IMC_FLAGS: &[FlagSpec] = &[
    FlagSpec::valued("num_structs", "-c"),
    FlagSpec::valued("num_modes", "-n"),
    FlagSpec::valued("amplitude", "-a"),
];

fn imc_plan(props: &ResolvedProps, staged: &Staged) -> Result<Plan> {
    let binary = props.text("binary_path").unwrap_or("imc").to_string();
    let mut argv = vec![
        binary,
        staged.input("input_pdb_path").to_string(),
        staged.input("input_dat_path").to_string(),
        "-o".to_string(),
        IMC_PREFIX.to_string(),
    ];
    push_optional_flags(&mut argv, props, IMC_FLAGS);
    Ok(Plan {
        computation: Computation::Subprocess {
            argv,
            stdin_feed: None,
        },
        artifacts: vec![Artifact {
            staged_name: IMC_ARTIFACT.to_string(),
            role: "output_traj_path",
        }],
    })
}

/// Monte-Carlo IC-NMA conformational ensemble (iMODS `imc`).
pub fn imod_imc(
    input_pdb_path: &Path,
    input_dat_path: &Path,
    output_traj_path: &Path,
    properties: &Properties,
) -> Result<RunReport> {
    let props = resolve_properties("imod_imc", IMC_SCHEMA, properties)?;
    let remove_tmp = props.remove_tmp;
    let restart = props.restart;
    run_tool(ToolRun {
        tool: "imod_imc",
        staging: StagingMode::Sandbox,
        inputs: vec![
            InputFile {
                role: "input_pdb_path",
                source: input_pdb_path.to_path_buf(),
                accepted: &["pdb"],
            },
            InputFile {
                role: "input_dat_path",
                source: input_dat_path.to_path_buf(),
                accepted: &["dat", "txt"],
            },
        ],
        outputs: vec![OutputFile {
            role: "output_traj_path",
            dest: output_traj_path.to_path_buf(),
            accepted: &["pdb"],
        }],
        remove_tmp,
        restart,
        build: Box::new(move |staged| imc_plan(&props, staged)),
    })
}

// ---------------------------------------------------------------------------
// NOLB
// ---------------------------------------------------------------------------

const NOLB_PREFIX: &str = "nolb_ensemble";
const NOLB_ARTIFACT: &str = "nolb_ensemble_nlb_decoys.pdb";

static NOLB_SCHEMA: &[PropDef] = &[
    text_opt("binary_path"),
    PropDef::new(
        "num_structs",
        PropKind::Int,
        Some(PropValue::Int(500)),
        Constraint::MinInt(0),
    ),
    float_prop("cutoff", 5.0),
    float_prop("rmsd", 1.0),
];

static NOLB_FLAGS: &[FlagSpec] = &[
    FlagSpec::valued("num_structs", "-s"),
    FlagSpec::valued("cutoff", "-c"),
    FlagSpec::valued("rmsd", "--rmsd"),
];

/// Decoy-generation settings that are always passed.
static NOLB_FIXED_TAIL: &[&str] = &["--dist", "1", "--nSteps", "5000", "--tol", "0.001"];

fn nolb_plan(props: &ResolvedProps, staged: &Staged) -> Result<Plan> {
    let binary = props.text("binary_path").unwrap_or("NOLB").to_string();
    let mut argv = vec![
        binary,
        staged.input("input_pdb_path").to_string(),
        "-o".to_string(),
        NOLB_PREFIX.to_string(),
        // minimize generated structures
        "-m".to_string(),
    ];
    push_optional_flags(&mut argv, props, NOLB_FLAGS);
    argv.extend(NOLB_FIXED_TAIL.iter().map(|t| t.to_string()));
    Ok(Plan {
        computation: Computation::Subprocess {
            argv,
            stdin_feed: None,
        },
        artifacts: vec![Artifact {
            staged_name: NOLB_ARTIFACT.to_string(),
            role: "output_pdb_path",
        }],
    })
}

/// Non-linear rigid-block NMA ensemble (NOLB).
pub fn nolb_nma(
    input_pdb_path: &Path,
    output_pdb_path: &Path,
    properties: &Properties,
) -> Result<RunReport> {
    let props = resolve_properties("nolb_nma", NOLB_SCHEMA, properties)?;
    let remove_tmp = props.remove_tmp;
    let restart = props.restart;
    run_tool(ToolRun {
        tool: "nolb_nma",
        staging: StagingMode::Relative,
        inputs: vec![InputFile {
            role: "input_pdb_path",
            source: input_pdb_path.to_path_buf(),
            accepted: &["pdb"],
        }],
        outputs: vec![OutputFile {
            role: "output_pdb_path",
            dest: output_pdb_path.to_path_buf(),
            accepted: &["pdb"],
        }],
        remove_tmp,
        restart,
        build: Box::new(move |staged| nolb_plan(&props, staged)),
    })
}

// ---------------------------------------------------------------------------
// ANM ensemble (in-process)
// ---------------------------------------------------------------------------

/// Default RNG seed so repeated runs reproduce the same ensemble.
const ANM_DEFAULT_SEED: i64 = 42;

static ANM_SCHEMA: &[PropDef] = &[
    PropDef::new(
        "num_structs",
        PropKind::Int,
        Some(PropValue::Int(500)),
        Constraint::MinInt(1),
    ),
    text_opt("selection"),
    PropDef::new(
        "cutoff",
        PropKind::Float,
        Some(PropValue::Float(15.0)),
        Constraint::FloatMin(4.0),
    ),
    PropDef::new(
        "gamma",
        PropKind::Float,
        Some(PropValue::Float(1.0)),
        Constraint::FloatPositive,
    ),
    PropDef::new(
        "rmsd",
        PropKind::Float,
        Some(PropValue::Float(1.0)),
        Constraint::FloatPositive,
    ),
    int_prop("seed", ANM_DEFAULT_SEED),
];

fn anm_parameters(props: &ResolvedProps) -> Result<AnmParameters> {
    let selection: Selection = props
        .text("selection")
        .unwrap_or("calpha")
        .parse()
        .map_err(|e: String| Error::config(format!("anm_ensemble: {}", e)))?;
    Ok(AnmParameters {
        selection,
        cutoff: props.float("cutoff").unwrap_or(15.0),
        gamma: props.float("gamma").unwrap_or(1.0),
        rmsd: props.float("rmsd").unwrap_or(1.0),
        num_structs: props.int("num_structs").unwrap_or(500) as usize,
        seed: props.int("seed").unwrap_or(ANM_DEFAULT_SEED) as u64,
    })
}

fn anm_plan(props: &ResolvedProps, staged: &Staged) -> Result<Plan> {
    let params = anm_parameters(props)?;
    let input = staged.dir.join(staged.input("input_pdb_path"));
    let output_name = staged.output("output_pdb_path").to_string();
    let output = staged.dir.join(&output_name);
    Ok(Plan {
        computation: Computation::InProcess(Box::new(move |_staged| {
            let written = flexdyn_anm::generate_ensemble(&input, &output, &params)
                .map_err(|e| Error::execution(format!("anm_ensemble: {}", e), None))?;
            tracing::debug!(models = written, "sampled ensemble");
            Ok(())
        })),
        artifacts: vec![Artifact {
            staged_name: output_name,
            role: "output_pdb_path",
        }],
    })
}

/// Anisotropic-network-model ensemble generation, run in-process but
/// through the same staging/relocation/cleanup protocol as the
/// subprocess tools.
pub fn anm_ensemble(
    input_pdb_path: &Path,
    output_pdb_path: &Path,
    properties: &Properties,
) -> Result<RunReport> {
    let props = resolve_properties("anm_ensemble", ANM_SCHEMA, properties)?;
    // surface selection errors before staging
    anm_parameters(&props)?;
    let remove_tmp = props.remove_tmp;
    let restart = props.restart;
    run_tool(ToolRun {
        tool: "anm_ensemble",
        staging: StagingMode::Relative,
        inputs: vec![InputFile {
            role: "input_pdb_path",
            source: input_pdb_path.to_path_buf(),
            accepted: &["pdb"],
        }],
        outputs: vec![OutputFile {
            role: "output_pdb_path",
            dest: output_pdb_path.to_path_buf(),
            accepted: &["pdb"],
        }],
        remove_tmp,
        restart,
        build: Box::new(move |staged| anm_plan(&props, staged)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;
    use std::fs;

    fn temp_root(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "flexdyn_tools_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp root");
        dir
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    fn props(pairs: &[(&str, Value)]) -> Properties {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn dist_staged(dir: PathBuf, input: &'static str) -> Staged {
        Staged::fake(
            dir,
            &[("input_structure_path", input)],
            &[
                ("output_pdb_path", "out.pdb"),
                ("output_gro_path", "out.gro"),
                ("output_dat_path", "out.dat"),
            ],
        )
    }

    fn plan_argv(plan: &Plan) -> &[String] {
        match &plan.computation {
            Computation::Subprocess { argv, .. } => argv,
            Computation::InProcess(_) => panic!("expected subprocess plan"),
        }
    }

    #[test]
    fn dist_argv_layout_and_stdin_feed() {
        let raw = props(&[("vdw", Value::from(2)), ("bond_angle", Value::from(1))]);
        let resolved = resolve_properties("concoord_dist", DIST_SCHEMA, &raw).expect("resolve");
        let staged = dist_staged(PathBuf::from("/nonexistent"), "structure.pdb");
        let plan = dist_plan(&resolved, &staged).expect("plan");

        let argv = plan_argv(&plan);
        assert_eq!(
            &argv[..9],
            &[
                "dist", "-op", "out.pdb", "-og", "out.gro", "-od", "out.dat", "-p",
                "structure.pdb"
            ]
        );
        // schema defaults for the numeric properties
        assert_eq!(
            &argv[9..],
            &["-c", "4.0", "-m", "50", "-damp", "1.0"]
        );
        match &plan.computation {
            Computation::Subprocess { stdin_feed, .. } => {
                assert_eq!(stdin_feed.as_deref(), Some("2\n1\n"));
            }
            _ => panic!("expected subprocess"),
        }
    }

    #[test]
    fn dist_gro_input_switches_the_input_flag() {
        let raw = props(&[]);
        let resolved = resolve_properties("concoord_dist", DIST_SCHEMA, &raw).expect("resolve");
        let staged = dist_staged(PathBuf::from("/nonexistent"), "structure.gro");
        let plan = dist_plan(&resolved, &staged).expect("plan");
        let argv = plan_argv(&plan);
        assert!(argv.contains(&"-g".to_string()));
        assert!(!argv.contains(&"-p".to_string()));
    }

    #[test]
    fn dist_falsy_numeric_properties_drop_flag_and_value() {
        let raw = props(&[
            ("cutoff", Value::from(0.0)),
            ("min_distances", Value::from(0)),
            ("damp", Value::from(0.0)),
        ]);
        let resolved = resolve_properties("concoord_dist", DIST_SCHEMA, &raw).expect("resolve");
        let staged = dist_staged(PathBuf::from("/nonexistent"), "structure.pdb");
        let plan = dist_plan(&resolved, &staged).expect("plan");
        let argv = plan_argv(&plan);
        for token in ["-c", "-m", "-damp", "0", "0.0"] {
            assert!(
                !argv.contains(&token.to_string()),
                "token '{}' must be absent from {:?}",
                token,
                argv
            );
        }
    }

    #[test]
    fn dist_invalid_vdw_is_rejected_before_any_launch() {
        let root = temp_root("dist_vdw");
        let input = root.join("structure.pdb");
        fs::write(&input, b"ATOM").expect("input");
        let raw = props(&[("vdw", Value::from(7))]);
        let err = concoord_dist(
            &input,
            &root.join("out.pdb"),
            &root.join("out.gro"),
            &root.join("out.dat"),
            &raw,
        )
        .expect_err("must fail");
        assert!(matches!(err, Error::Config(_)), "got {:?}", err);
        let _ = fs::remove_dir_all(root);
    }

    fn disco_staged(dir: PathBuf, traj: &'static str) -> Staged {
        Staged::fake(
            dir,
            &[
                ("input_pdb_path", "dist.pdb"),
                ("input_dat_path", "dist.dat"),
            ],
            &[
                ("output_traj_path", traj),
                ("output_rmsd_path", "rmsd.dat"),
                ("output_bfactor_path", "bfactor.pdb"),
            ],
        )
    }

    fn fake_concoord_library(root: &Path, set: &str) -> PathBuf {
        let lib = root.join("concoord_lib");
        fs::create_dir_all(&lib).expect("lib dir");
        fs::write(lib.join(format!("MARGINS_{}.DAT", set)), b"margins").expect("margins");
        fs::write(lib.join(format!("ATOMS_{}.DAT", set)), b"atoms").expect("atoms");
        fs::write(lib.join("BONDS.DAT"), b"bonds").expect("bonds");
        lib
    }

    #[test]
    fn disco_extension_dispatch_selects_exactly_one_mode_flag() {
        let root = temp_root("disco_dispatch");
        let lib = fake_concoord_library(&root, "oplsua");
        let raw = props(&[]);
        let resolved = resolve_properties("concoord_disco", DISCO_SCHEMA, &raw).expect("resolve");

        for (traj, flag) in [("t.pdb", "-on"), ("t.gro", "-ot"), ("t.xtc", "-ox")] {
            let work = root.join(format!("work_{}", flag.trim_start_matches('-')));
            fs::create_dir_all(&work).expect("work");
            let staged = disco_staged(work, traj);
            let plan = disco_plan(&resolved, &lib, &staged).expect("plan");
            let argv = plan_argv(&plan);
            let mode_flags: Vec<_> = argv
                .iter()
                .filter(|t| ["-on", "-ot", "-ox"].contains(&t.as_str()))
                .collect();
            assert_eq!(mode_flags, vec![flag], "trajectory {}", traj);
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn disco_unsupported_trajectory_extension_is_a_configuration_error() {
        let root = temp_root("disco_badext");
        let pdb = root.join("dist.pdb");
        let dat = root.join("dist.dat");
        fs::write(&pdb, b"ATOM").expect("pdb");
        fs::write(&dat, b"bounds").expect("dat");
        let lib = fake_concoord_library(&root, "oplsua");
        let raw = props(&[(
            "parameter_library_path",
            Value::from(lib.display().to_string()),
        )]);
        // the default binary does not exist on the test host, so the
        // error can only come from the pre-launch extension check
        let err = concoord_disco(
            &pdb,
            &dat,
            &root.join("traj.xyz"),
            &root.join("rmsd.dat"),
            &root.join("bfactor.pdb"),
            &raw,
        )
        .expect_err("must fail");
        assert!(matches!(err, Error::Config(_)), "got {:?}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn disco_parameter_library_is_staged_under_fixed_names() {
        let root = temp_root("disco_lib");
        let lib = fake_concoord_library(&root, "oplsaa");
        let work = root.join("work");
        fs::create_dir_all(&work).expect("work");
        let raw = props(&[("vdw", Value::from(2))]);
        let resolved = resolve_properties("concoord_disco", DISCO_SCHEMA, &raw).expect("resolve");
        let staged = disco_staged(work.clone(), "traj.pdb");
        disco_plan(&resolved, &lib, &staged).expect("plan");
        for name in ["MARGINS.DAT", "ATOMS.DAT", "BONDS.DAT"] {
            assert!(work.join(name).is_file(), "{} must be staged", name);
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn disco_missing_library_file_is_a_staging_error() {
        let root = temp_root("disco_nolib");
        let lib = root.join("incomplete_lib");
        fs::create_dir_all(&lib).expect("lib");
        // only bonds present; margins for the selected set are missing
        fs::write(lib.join("BONDS.DAT"), b"bonds").expect("bonds");
        let work = root.join("work");
        fs::create_dir_all(&work).expect("work");
        let raw = props(&[("vdw", Value::from(5))]);
        let resolved = resolve_properties("concoord_disco", DISCO_SCHEMA, &raw).expect("resolve");
        let staged = disco_staged(work, "traj.pdb");
        let err = disco_plan(&resolved, &lib, &staged).expect_err("must fail");
        assert!(matches!(err, Error::Staging(_)), "got {:?}", err);
        assert!(err.to_string().contains("MARGINS_li.DAT"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn disco_unset_optional_properties_stay_off_the_command_line() {
        let root = temp_root("disco_defaults");
        let lib = fake_concoord_library(&root, "oplsua");
        let work = root.join("work");
        fs::create_dir_all(&work).expect("work");
        let raw = props(&[]);
        let resolved = resolve_properties("concoord_disco", DISCO_SCHEMA, &raw).expect("resolve");
        let staged = disco_staged(work, "traj.pdb");
        let plan = disco_plan(&resolved, &lib, &staged).expect("plan");
        let argv = plan_argv(&plan);
        // nothing beyond the required flags and the mode flag
        assert_eq!(
            argv[1..],
            [
                "-p",
                "dist.pdb",
                "-d",
                "dist.dat",
                "-or",
                "rmsd.dat",
                "-of",
                "bfactor.pdb",
                "-on",
                "traj.pdb"
            ]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn imode_argv_and_artifact_mapping() {
        let raw = props(&[("cg", Value::from(0))]);
        let resolved = resolve_properties("imod_imode", IMODE_SCHEMA, &raw).expect("resolve");
        let staged = Staged::fake(
            PathBuf::from("/nonexistent"),
            &[("input_pdb_path", "structure.pdb")],
            &[("output_dat_path", "evecs.dat")],
        );
        let plan = imode_plan(&resolved, &staged).expect("plan");
        let argv = plan_argv(&plan);
        // cg is positional-style and always emitted, even when 0 (CA model)
        assert_eq!(
            argv,
            &["imode_gcc", "structure.pdb", "-o", "imods_evecs", "-m", "0"]
        );
        assert_eq!(plan.artifacts.len(), 1);
        assert_eq!(plan.artifacts[0].staged_name, "imods_evecs_ic.evec");
        assert_eq!(plan.artifacts[0].role, "output_dat_path");
    }

    #[test]
    fn imove_positional_order_then_optional_flags() {
        let raw = props(&[("pc", Value::from(3))]);
        let resolved = resolve_properties("imod_imove", IMOVE_SCHEMA, &raw).expect("resolve");
        let staged = Staged::fake(
            PathBuf::from("/nonexistent"),
            &[
                ("input_pdb_path", "structure.pdb"),
                ("input_dat_path", "evecs.dat"),
            ],
            &[("output_pdb_path", "animation.pdb")],
        );
        let plan = imove_plan(&resolved, &staged).expect("plan");
        let argv = plan_argv(&plan);
        assert_eq!(
            argv,
            &[
                "imove",
                "structure.pdb",
                "evecs.dat",
                "animation.pdb",
                "3",
                "-c",
                "11"
            ]
        );
        // sandbox contract: nothing but bare filenames after the binary
        assert!(argv.iter().skip(1).all(|t| !t.contains('/')));
    }

    #[test]
    fn imc_argv_uses_fixed_prefix_and_maps_tool_named_artifact() {
        let raw = props(&[]);
        let resolved = resolve_properties("imod_imc", IMC_SCHEMA, &raw).expect("resolve");
        let staged = Staged::fake(
            PathBuf::from("/nonexistent"),
            &[
                ("input_pdb_path", "structure.pdb"),
                ("input_dat_path", "evecs.dat"),
            ],
            &[("output_traj_path", "ensemble.pdb")],
        );
        let plan = imc_plan(&resolved, &staged).expect("plan");
        let argv = plan_argv(&plan);
        assert_eq!(
            argv,
            &[
                "imc",
                "structure.pdb",
                "evecs.dat",
                "-o",
                "imod_ensemble",
                "-c",
                "500",
                "-n",
                "5",
                "-a",
                "1.0"
            ]
        );
        assert_eq!(plan.artifacts[0].staged_name, "imod_ensemble.pdb");
    }

    #[test]
    fn nolb_argv_matches_the_decoy_generation_grammar() {
        let raw = props(&[
            ("num_structs", Value::from(20)),
            ("cutoff", Value::from(5.0)),
            ("rmsd", Value::from(1.0)),
        ]);
        let resolved = resolve_properties("nolb_nma", NOLB_SCHEMA, &raw).expect("resolve");
        let staged = Staged::fake(
            PathBuf::from("/nonexistent"),
            &[("input_pdb_path", "structure.pdb")],
            &[("output_pdb_path", "decoys.pdb")],
        );
        let plan = nolb_plan(&resolved, &staged).expect("plan");
        let argv = plan_argv(&plan);
        assert_eq!(
            argv,
            &[
                "NOLB",
                "structure.pdb",
                "-o",
                "nolb_ensemble",
                "-m",
                "-s",
                "20",
                "-c",
                "5.0",
                "--rmsd",
                "1.0",
                "--dist",
                "1",
                "--nSteps",
                "5000",
                "--tol",
                "0.001"
            ]
        );
        assert_eq!(plan.artifacts[0].staged_name, "nolb_ensemble_nlb_decoys.pdb");
    }

    #[test]
    fn unknown_property_is_rejected_by_every_tool() {
        let root = temp_root("unknown_prop");
        let input = root.join("structure.pdb");
        fs::write(&input, b"ATOM").expect("input");
        let raw = props(&[("number_of_structures", Value::from(10))]);
        let err =
            nolb_nma(&input, &root.join("out.pdb"), &raw).expect_err("must fail");
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("number_of_structures"));
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn imc_sandbox_run_relocates_the_tool_named_output() {
        let root = temp_root("imc_run");
        let pdb = root.join("structure.pdb");
        let dat = root.join("evecs.dat");
        fs::write(&pdb, b"ATOM").expect("pdb");
        fs::write(&dat, b"modes").expect("dat");
        let tool = fake_tool(&root, "imc.sh", "echo MODEL > imod_ensemble.pdb");
        let dest = root.join("results").join("ensemble.pdb");

        let raw = props(&[
            ("binary_path", Value::from(tool.display().to_string())),
            ("num_structs", Value::from(50)),
        ]);
        let report = imod_imc(&pdb, &dat, &dest, &raw).expect("run");
        assert!(!report.skipped);
        assert_eq!(report.exit_status, 0);
        assert!(flexdyn_core::is_non_empty_file(&dest));
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn concoord_dist_end_to_end_with_interactive_prompts() {
        let root = temp_root("dist_run");
        let input = root.join("structure.pdb");
        fs::write(&input, b"ATOM      1  CA  ALA A   1").expect("input");
        // answers the two stdin prompts, then produces whatever -op,
        // -og and -od name
        let tool = fake_tool(
            &root,
            "dist.sh",
            r#"cat > answers.txt
while [ $# -gt 0 ]; do
  case "$1" in
    -op) echo pdb > "$2"; shift 2;;
    -og) echo gro > "$2"; shift 2;;
    -od) echo dat > "$2"; shift 2;;
    *) shift;;
  esac
done"#,
        );

        let out_pdb = root.join("output.pdb");
        let out_gro = root.join("output.gro");
        let out_dat = root.join("output.dat");
        let raw = props(&[
            ("binary_path", Value::from(tool.display().to_string())),
            ("vdw", Value::from(2)),
            ("bond_angle", Value::from(1)),
            ("remove_tmp", Value::from(false)),
        ]);
        let report = concoord_dist(&input, &out_pdb, &out_gro, &out_dat, &raw).expect("run");
        assert!(flexdyn_core::is_non_empty_file(&out_pdb));
        assert!(flexdyn_core::is_non_empty_file(&out_gro));
        assert!(flexdyn_core::is_non_empty_file(&out_dat));

        let workdir = report.workdir_retained.expect("workdir kept");
        let answers = fs::read_to_string(workdir.join("answers.txt")).expect("answers");
        assert_eq!(answers, "2\n1\n");
        flexdyn_core::remove_dir_best_effort(&workdir);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn restart_skips_execution_even_with_a_broken_binary() {
        let root = temp_root("restart_tool");
        let input = root.join("structure.pdb");
        fs::write(&input, b"ATOM").expect("input");
        let out = root.join("decoys.pdb");
        fs::write(&out, b"MODEL 1").expect("prior output");
        let raw = props(&[
            ("binary_path", Value::from("/no/such/binary")),
            ("restart", Value::from(true)),
        ]);
        let report = nolb_nma(&input, &out, &raw).expect("restart run");
        assert!(report.skipped);
        assert_eq!(report.exit_status, 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn anm_rejects_unsupported_selection_before_staging() {
        let root = temp_root("anm_sel");
        let input = root.join("structure.pdb");
        fs::write(&input, b"ATOM").expect("input");
        let raw = props(&[("selection", Value::from("within 8 of resname LIG"))]);
        let err = anm_ensemble(&input, &root.join("out.pdb"), &raw).expect_err("must fail");
        assert!(matches!(err, Error::Config(_)), "got {:?}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn anm_ensemble_writes_the_requested_number_of_models() {
        use flexdyn_anm::{write_ensemble, NetworkAtom};

        let root = temp_root("anm_run");
        let atoms: Vec<NetworkAtom> = (0..10)
            .map(|i| {
                let t = i as f64 * 1.7;
                NetworkAtom {
                    serial: i + 1,
                    name: "CA".to_string(),
                    residue_name: "GLY".to_string(),
                    chain_id: "A".to_string(),
                    residue_number: i as isize + 1,
                    element: "C".to_string(),
                    occupancy: 1.0,
                    b_factor: 0.0,
                    position: [2.3 * t.cos(), 2.3 * t.sin(), 1.5 * i as f64],
                }
            })
            .collect();
        let input = root.join("structure.pdb");
        let reference = vec![atoms.iter().map(|a| a.position).collect::<Vec<_>>()];
        write_ensemble(&input, &atoms, &reference).expect("write input");

        let output = root.join("ensemble.pdb");
        let raw = props(&[
            ("selection", Value::from("calpha")),
            ("cutoff", Value::from(15.0)),
            ("gamma", Value::from(1.0)),
            ("rmsd", Value::from(1.0)),
            ("num_structs", Value::from(500)),
        ]);
        let report = anm_ensemble(&input, &output, &raw).expect("run");
        assert!(!report.skipped);
        assert_eq!(report.exit_status, 0);

        let text = fs::read_to_string(&output).expect("ensemble");
        let models = text.lines().filter(|l| l.starts_with("MODEL")).count();
        assert_eq!(models, 500);
        let _ = fs::remove_dir_all(root);
    }
}
