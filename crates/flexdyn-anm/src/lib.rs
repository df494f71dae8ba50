//! Anisotropic Network Model ensemble generation.
//!
//! The elastic network treats every selected atom as a node and joins
//! pairs closer than a cutoff with a spring of constant gamma. The
//! 3N x 3N Hessian of that network is eigendecomposed, the six
//! rigid-body modes are discarded, and conformers are drawn along the
//! lowest non-trivial modes with normally distributed amplitudes
//! weighted by inverse square-root eigenvalue. The ensemble is scaled
//! so its mean RMSD from the input conformation matches the requested
//! target, then serialized as a multi-model PDB.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use pdbtbx::{
    ContainsAtomConformer, ContainsAtomConformerResidue, ContainsAtomConformerResidueChain,
    Element, Format, ReadOptions, StrictnessLevel,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

/// Eigenvalues below this fraction of the largest eigenvalue are
/// treated as rigid-body modes.
const RIGID_MODE_TOLERANCE: f64 = 1e-8;

/// Number of non-trivial modes the sampler combines.
pub const SAMPLED_MODES: usize = 3;

#[derive(Debug, Error)]
pub enum AnmError {
    #[error("cannot read structure {path}: {message}")]
    Parse { path: String, message: String },

    #[error("selection '{selection}' matched no atoms in {path}")]
    EmptySelection { selection: String, path: String },

    #[error("network too small: {atoms} atoms leave no non-trivial modes")]
    TooFewModes { atoms: usize },

    #[error("cannot write ensemble {path}: {message}")]
    Write { path: String, message: String },
}

/// Closed set of supported atom selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Calpha,
    Backbone,
    Heavy,
    All,
}

impl Selection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Selection::Calpha => "calpha",
            Selection::Backbone => "backbone",
            Selection::Heavy => "heavy",
            Selection::All => "all",
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Selection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "calpha" | "ca" => Ok(Selection::Calpha),
            "backbone" => Ok(Selection::Backbone),
            "heavy" | "noh" => Ok(Selection::Heavy),
            "all" => Ok(Selection::All),
            other => Err(format!(
                "unsupported selection '{}' (supported: calpha, backbone, heavy, all)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnmParameters {
    pub selection: Selection,
    pub cutoff: f64,
    pub gamma: f64,
    pub rmsd: f64,
    pub num_structs: usize,
    pub seed: u64,
}

/// One atom of the selected network, with enough metadata to emit a
/// valid ATOM record again.
#[derive(Debug, Clone)]
pub struct NetworkAtom {
    pub serial: usize,
    pub name: String,
    pub residue_name: String,
    pub chain_id: String,
    pub residue_number: isize,
    pub element: String,
    pub occupancy: f64,
    pub b_factor: f64,
    pub position: [f64; 3],
}

/// Parse a PDB file and apply the selection.
pub fn load_network(path: &Path, selection: Selection) -> Result<Vec<NetworkAtom>, AnmError> {
    let file = File::open(path).map_err(|e| AnmError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let reader = BufReader::new(file);
    let (pdb, _warnings) = ReadOptions::new()
        .set_format(Format::Pdb)
        .set_level(StrictnessLevel::Loose)
        .read_raw(reader)
        .map_err(|errs| AnmError::Parse {
            path: path.display().to_string(),
            message: errs
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        })?;

    let mut atoms = Vec::new();
    for hier in pdb.atoms_with_hierarchy() {
        let atom = hier.atom();
        let name = atom.name().to_string();
        let is_hydrogen = atom
            .element()
            .map(|e| *e == Element::H)
            .unwrap_or_else(|| name.starts_with('H'));
        let keep = match selection {
            Selection::Calpha => name == "CA",
            Selection::Backbone => matches!(name.as_str(), "N" | "CA" | "C" | "O"),
            Selection::Heavy => !is_hydrogen,
            Selection::All => true,
        };
        if !keep {
            continue;
        }
        atoms.push(NetworkAtom {
            serial: atom.serial_number(),
            name,
            residue_name: hier.conformer().name().to_string(),
            chain_id: hier.chain().id().to_string(),
            residue_number: hier.residue().serial_number(),
            element: atom.element().map(|e| e.to_string()).unwrap_or_default(),
            occupancy: atom.occupancy(),
            b_factor: atom.b_factor(),
            position: [atom.x(), atom.y(), atom.z()],
        });
    }
    if atoms.is_empty() {
        return Err(AnmError::EmptySelection {
            selection: selection.as_str().to_string(),
            path: path.display().to_string(),
        });
    }
    Ok(atoms)
}

/// Build the 3N x 3N ANM Hessian. For each contact pair the
/// super-element is -gamma * (d x d) / |d|^2; diagonal blocks
/// accumulate the negated sum, so every row sums to zero.
pub fn build_hessian(positions: &[[f64; 3]], cutoff: f64, gamma: f64) -> DMatrix<f64> {
    let n = positions.len();
    let cutoff_sq = cutoff * cutoff;
    let mut hessian = DMatrix::zeros(3 * n, 3 * n);

    for i in 0..n {
        for j in (i + 1)..n {
            let d = [
                positions[j][0] - positions[i][0],
                positions[j][1] - positions[i][1],
                positions[j][2] - positions[i][2],
            ];
            let dist_sq = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
            if dist_sq > cutoff_sq || dist_sq == 0.0 {
                continue;
            }
            for a in 0..3 {
                for b in 0..3 {
                    let element = -gamma * d[a] * d[b] / dist_sq;
                    hessian[(3 * i + a, 3 * j + b)] = element;
                    hessian[(3 * j + a, 3 * i + b)] = element;
                    hessian[(3 * i + a, 3 * i + b)] -= element;
                    hessian[(3 * j + a, 3 * j + b)] -= element;
                }
            }
        }
    }
    hessian
}

/// Non-trivial normal modes, lowest frequency first.
pub struct AnmModes {
    pub eigenvalues: Vec<f64>,
    pub eigenvectors: Vec<DVector<f64>>,
}

/// Eigendecompose the Hessian, drop the rigid-body modes, keep the
/// `count` lowest non-trivial ones.
pub fn lowest_modes(hessian: DMatrix<f64>, count: usize) -> Result<AnmModes, AnmError> {
    let n_atoms = hessian.nrows() / 3;
    let eigen = SymmetricEigen::new(hessian);

    // nalgebra does not guarantee eigenvalue order
    let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[a]
            .partial_cmp(&eigen.eigenvalues[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let largest = order
        .last()
        .map(|&i| eigen.eigenvalues[i].abs())
        .unwrap_or(0.0);
    let threshold = largest.max(1.0) * RIGID_MODE_TOLERANCE;

    let mut eigenvalues = Vec::new();
    let mut eigenvectors = Vec::new();
    for &idx in &order {
        let lambda = eigen.eigenvalues[idx];
        if lambda <= threshold {
            continue;
        }
        eigenvalues.push(lambda);
        eigenvectors.push(eigen.eigenvectors.column(idx).into_owned());
        if eigenvalues.len() == count {
            break;
        }
    }
    if eigenvalues.is_empty() {
        return Err(AnmError::TooFewModes { atoms: n_atoms });
    }
    Ok(AnmModes {
        eigenvalues,
        eigenvectors,
    })
}

/// Draw `num_structs` conformations along the given modes. Amplitudes
/// are standard normal draws weighted by inverse square-root
/// eigenvalue; the whole ensemble is then rescaled so the mean RMSD
/// from the reference equals `rmsd`. Deterministic for a fixed seed.
pub fn sample_ensemble(
    reference: &[[f64; 3]],
    modes: &AnmModes,
    num_structs: usize,
    rmsd: f64,
    seed: u64,
) -> Vec<Vec<[f64; 3]>> {
    let n = reference.len();
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();

    let mut displacements: Vec<DVector<f64>> = Vec::with_capacity(num_structs);
    let mut rmsd_sum = 0.0;
    for _ in 0..num_structs {
        let mut disp = DVector::zeros(3 * n);
        for (lambda, vector) in modes.eigenvalues.iter().zip(&modes.eigenvectors) {
            let amplitude: f64 = normal.sample(&mut rng);
            disp += vector * (amplitude / lambda.sqrt());
        }
        rmsd_sum += (disp.norm_squared() / n as f64).sqrt();
        displacements.push(disp);
    }

    let mean_rmsd = rmsd_sum / num_structs.max(1) as f64;
    let scale = if mean_rmsd > 0.0 { rmsd / mean_rmsd } else { 0.0 };

    displacements
        .into_iter()
        .map(|disp| {
            (0..n)
                .map(|i| {
                    [
                        reference[i][0] + scale * disp[3 * i],
                        reference[i][1] + scale * disp[3 * i + 1],
                        reference[i][2] + scale * disp[3 * i + 2],
                    ]
                })
                .collect()
        })
        .collect()
}

/// Serialize the sampled ensemble as a multi-model PDB over the
/// selected atoms.
pub fn write_ensemble(
    path: &Path,
    atoms: &[NetworkAtom],
    coordsets: &[Vec<[f64; 3]>],
) -> Result<(), AnmError> {
    let to_write_err = |e: std::io::Error| AnmError::Write {
        path: path.display().to_string(),
        message: e.to_string(),
    };
    let file = File::create(path).map_err(to_write_err)?;
    let mut out = BufWriter::new(file);
    for (model_index, coords) in coordsets.iter().enumerate() {
        writeln!(out, "MODEL     {:>4}", model_index + 1).map_err(to_write_err)?;
        for (atom, pos) in atoms.iter().zip(coords) {
            writeln!(out, "{}", format_atom_record(atom, pos)).map_err(to_write_err)?;
        }
        writeln!(out, "ENDMDL").map_err(to_write_err)?;
    }
    writeln!(out, "END").map_err(to_write_err)?;
    out.flush().map_err(to_write_err)?;
    Ok(())
}

fn format_atom_record(atom: &NetworkAtom, pos: &[f64; 3]) -> String {
    // PDB column conventions: names shorter than four characters start
    // in column 14.
    let name = if atom.name.len() >= 4 {
        atom.name.clone()
    } else {
        format!(" {:<3}", atom.name)
    };
    let chain = atom.chain_id.chars().next().unwrap_or('A');
    format!(
        "ATOM  {:>5} {:<4} {:<3} {}{:>4}    {:>8.3}{:>8.3}{:>8.3}{:>6.2}{:>6.2}          {:>2}",
        atom.serial % 100_000,
        name,
        atom.residue_name,
        chain,
        atom.residue_number % 10_000,
        pos[0],
        pos[1],
        pos[2],
        atom.occupancy,
        atom.b_factor,
        atom.element
    )
}

/// End-to-end generation: parse, select, build, decompose, sample,
/// serialize. Returns the number of models written.
pub fn generate_ensemble(
    input_pdb: &Path,
    output_pdb: &Path,
    params: &AnmParameters,
) -> Result<usize, AnmError> {
    let atoms = load_network(input_pdb, params.selection)?;
    tracing::debug!(
        atoms = atoms.len(),
        selection = %params.selection,
        cutoff = params.cutoff,
        "building elastic network"
    );
    let positions: Vec<[f64; 3]> = atoms.iter().map(|a| a.position).collect();
    let hessian = build_hessian(&positions, params.cutoff, params.gamma);
    let modes = lowest_modes(hessian, SAMPLED_MODES)?;
    let coordsets = sample_ensemble(
        &positions,
        &modes,
        params.num_structs,
        params.rmsd,
        params.seed,
    );
    write_ensemble(output_pdb, &atoms, &coordsets)?;
    Ok(coordsets.len())
}
