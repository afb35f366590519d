//! `facegate models`: checks that the ONNX models facegated loads are in place.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;

use facegate_vision::{DETECTOR_MODEL, EMBEDDER_MODEL, LANDMARK_MODEL};

const MODELS: &[(&str, &str)] = &[
    (DETECTOR_MODEL, "face detection (UltraFace RFB-320)"),
    (EMBEDDER_MODEL, "face descriptors (FaceNet, VGGFace2)"),
    (LANDMARK_MODEL, "face mesh landmarks"),
];

/// Compute SHA-256 hex digest of a file.
fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Report each model file in `dir`. Returns `true` when all are present.
pub fn check(dir: &Path) -> Result<bool> {
    println!("model directory: {}", dir.display());

    let mut all_present = true;
    for (name, purpose) in MODELS {
        let path = dir.join(name);
        match fs::metadata(&path) {
            Ok(meta) => {
                let digest = sha256_file(&path)?;
                println!(
                    "  {name}: ok ({:.1} MB, sha256 {digest})",
                    meta.len() as f64 / 1_048_576.0
                );
            }
            Err(_) => {
                println!("  {name}: missing ({purpose})");
                all_present = false;
            }
        }
    }

    if !all_present {
        println!("place the missing files in the directory above or set FACEGATE_MODEL_DIR");
    }
    Ok(all_present)
}
