//! Paired (raw, EMA) checkpoints.
//!
//! A requested path `p` maps to two sibling directories, `parent(p)/stem(p)` and
//! `parent(p)/stem(p)_ema`; the extension of `p` is discarded. Each directory is written by a
//! [`CheckpointBackend`] with replace semantics.
//!
//! The two directory writes are independent, so the pair carries a marker file
//! `parent(p)/stem(p).pair.json`. It is removed before either directory is touched and written
//! only after both writes succeed; [`CheckpointCoordinator::load_pair`] refuses a pair without
//! it. A crash mid-save therefore leaves a pair that loads as an error instead of a silently
//! mismatched raw/EMA combination.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::params::ParamSet;
use crate::{Error, Result};

/// File name of the serialized tree inside a checkpoint directory.
pub const PARAMS_FILE: &str = "params.safetensors";

fn stem_of(path: &Path) -> Result<(PathBuf, String)> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Checkpoint(format!("checkpoint path {} has no file stem", path.display())))?;
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    Ok((parent, stem.to_string()))
}

/// `(parent/stem, parent/stem_ema)` for a requested checkpoint path.
pub fn checkpoint_directories(path: impl AsRef<Path>) -> Result<(PathBuf, PathBuf)> {
    let (parent, stem) = stem_of(path.as_ref())?;
    Ok((parent.join(&stem), parent.join(format!("{stem}_ema"))))
}

/// `parent/stem.pair.json`.
pub fn pair_marker_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let (parent, stem) = stem_of(path.as_ref())?;
    Ok(parent.join(format!("{stem}.pair.json")))
}

/// Contents of the pair marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairMarker {
    pub global_step: u64,
    pub raw: String,
    pub ema: String,
}

fn ignore_not_found(r: io::Result<()>) -> Result<()> {
    match r {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Remove a file, symlink or directory tree at `path`; missing is fine.
fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => ignore_not_found(fs::remove_dir_all(path)),
        Ok(_) => ignore_not_found(fs::remove_file(path)),
        Err(e) => ignore_not_found(Err(e)),
    }
}

/// `dir` with its parent canonicalized; the final component is left alone so a symlink is not
/// followed.
fn resolve_parent(dir: &Path) -> PathBuf {
    match (dir.parent(), dir.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
            fs::canonicalize(parent)
                .map(|p| p.join(name))
                .unwrap_or_else(|_| dir.to_path_buf())
        }
        _ => dir.to_path_buf(),
    }
}

fn sibling(path: &Path, tag: &str) -> Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Checkpoint(format!("{} has no file name", path.display())))?;
    Ok(path.with_file_name(format!(".{name}.{tag}-{}", std::process::id())))
}

/// Write `bytes` to `path` through a temp sibling and a rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = sibling(path, "tmp")?;
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Storage for one serialized parameter tree per directory.
pub trait CheckpointBackend: fmt::Debug + Send + Sync {
    /// Write `params` into `dir`. With `force`, existing contents are replaced; without it an
    /// existing `dir` is an error.
    fn save(&self, dir: &Path, params: &ParamSet, force: bool) -> Result<()>;
    fn load(&self, dir: &Path) -> Result<ParamSet>;
    /// Delete `dir` and everything under it. Missing directories are not an error.
    fn remove(&self, dir: &Path) -> Result<()>;
    /// Make `link` an alias of `target`, replacing whatever `link` was.
    fn link(&self, target: &Path, link: &Path) -> Result<()>;
}

/// One `params.safetensors` (little-endian `f32`) per directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct SafetensorsBackend;

impl SafetensorsBackend {
    fn encode(params: &ParamSet) -> Result<Vec<u8>> {
        let buffers: Vec<(String, Vec<usize>, Vec<u8>)> = params
            .iter()
            .map(|(k, a)| {
                let bytes = a.iter().flat_map(|v| v.to_le_bytes()).collect();
                (k.clone(), a.shape().to_vec(), bytes)
            })
            .collect();
        let mut views = HashMap::new();
        for (k, shape, bytes) in &buffers {
            views.insert(k.clone(), TensorView::new(Dtype::F32, shape.clone(), bytes)?);
        }
        let mut meta = HashMap::new();
        meta.insert("format".to_string(), "scoresde-params".to_string());
        Ok(safetensors::tensor::serialize(&views, &Some(meta))?)
    }

    fn decode(bytes: &[u8]) -> Result<ParamSet> {
        let st = SafeTensors::deserialize(bytes)?;
        let mut out = ParamSet::new();
        for (name, view) in st.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(Error::Checkpoint(format!("tensor `{name}` is {:?}, expected F32", view.dtype())));
            }
            let data: Vec<f32> = view
                .data()
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let arr = ArrayD::from_shape_vec(IxDyn(view.shape()), data)
                .map_err(|e| Error::Checkpoint(format!("tensor `{name}`: {e}")))?;
            out.insert(name, arr);
        }
        Ok(out)
    }
}

impl CheckpointBackend for SafetensorsBackend {
    fn save(&self, dir: &Path, params: &ParamSet, force: bool) -> Result<()> {
        let exists = fs::symlink_metadata(dir).is_ok();
        if exists && !force {
            return Err(Error::Checkpoint(format!("{} already exists", dir.display())));
        }
        if let Some(parent) = dir.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        // build next to the target, then swap it in
        let tmp = sibling(dir, "tmp")?;
        remove_any(&tmp)?;
        fs::create_dir(&tmp)?;
        fs::write(tmp.join(PARAMS_FILE), Self::encode(params)?)?;
        if exists {
            let old = sibling(dir, "old")?;
            remove_any(&old)?;
            fs::rename(dir, &old)?;
            fs::rename(&tmp, dir)?;
            remove_any(&old)?;
        } else {
            fs::rename(&tmp, dir)?;
        }
        Ok(())
    }

    fn load(&self, dir: &Path) -> Result<ParamSet> {
        let bytes = fs::read(dir.join(PARAMS_FILE))?;
        Self::decode(&bytes)
    }

    fn remove(&self, dir: &Path) -> Result<()> {
        remove_any(dir)
    }

    fn link(&self, target: &Path, link: &Path) -> Result<()> {
        remove_any(link)?;
        if let Some(parent) = link.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        // relative when both live in the same directory, so the pair can be moved as a whole
        let dest = match (target.parent(), link.parent(), target.file_name()) {
            (Some(a), Some(b), Some(name)) if a == b => PathBuf::from(name),
            _ => target.to_path_buf(),
        };
        #[cfg(unix)]
        {
            if std::os::unix::fs::symlink(&dest, link).is_ok() {
                return Ok(());
            }
            warn!(link = %link.display(), "symlink failed, copying checkpoint instead");
        }
        fs::create_dir_all(link)?;
        fs::copy(target.join(PARAMS_FILE), link.join(PARAMS_FILE))?;
        Ok(())
    }
}

/// Notified after every completed save on the primary process.
pub trait CheckpointListener: Send + Sync {
    fn after_save_checkpoint(&self, coordinator: &CheckpointCoordinator);
}

/// Saves, removes and links (raw, EMA) pairs.
pub struct CheckpointCoordinator {
    backend: Box<dyn CheckpointBackend>,
    is_primary: bool,
    listeners: Vec<Box<dyn CheckpointListener>>,
    last_global_step_saved: Option<u64>,
    last_checkpoint_saved: Option<PathBuf>,
}

impl fmt::Debug for CheckpointCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointCoordinator")
            .field("backend", &self.backend)
            .field("is_primary", &self.is_primary)
            .field("listeners", &self.listeners.len())
            .field("last_global_step_saved", &self.last_global_step_saved)
            .field("last_checkpoint_saved", &self.last_checkpoint_saved)
            .finish()
    }
}

impl CheckpointCoordinator {
    pub fn new(backend: Box<dyn CheckpointBackend>, is_primary: bool) -> Self {
        Self {
            backend,
            is_primary,
            listeners: Vec::new(),
            last_global_step_saved: None,
            last_checkpoint_saved: None,
        }
    }

    /// Safetensors backend.
    pub fn safetensors(is_primary: bool) -> Self {
        Self::new(Box::new(SafetensorsBackend), is_primary)
    }

    pub fn add_listener(&mut self, listener: Box<dyn CheckpointListener>) {
        self.listeners.push(listener);
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn last_global_step_saved(&self) -> Option<u64> {
        self.last_global_step_saved
    }

    pub fn last_checkpoint_saved(&self) -> Option<&Path> {
        self.last_checkpoint_saved.as_deref()
    }

    pub fn backend(&self) -> &dyn CheckpointBackend {
        self.backend.as_ref()
    }

    /// Write both directories (replacing old contents), then the marker.
    ///
    /// Both writes are attempted even if the first fails; the first error is returned and no
    /// marker is written.
    pub fn save(
        &mut self,
        params: &ParamSet,
        params_ema: &ParamSet,
        path: impl AsRef<Path>,
        global_step: u64,
    ) -> Result<()> {
        let path = path.as_ref();
        if !params.same_structure(params_ema) {
            return Err(Error::Structure("raw and EMA parameters differ in structure".to_string()));
        }
        let (raw_dir, ema_dir) = checkpoint_directories(path)?;
        let marker = pair_marker_path(path)?;
        remove_any(&marker)?;

        let raw = self.backend.save(&raw_dir, params, true);
        let ema = self.backend.save(&ema_dir, params_ema, true);
        raw?;
        ema?;

        let contents = PairMarker {
            global_step,
            raw: dir_name(&raw_dir),
            ema: dir_name(&ema_dir),
        };
        write_atomic(&marker, &serde_json::to_vec_pretty(&contents)?)?;

        self.last_global_step_saved = Some(global_step);
        self.last_checkpoint_saved = Some(path.to_path_buf());
        info!(path = %path.display(), global_step, "saved checkpoint pair");

        if self.is_primary {
            for l in &self.listeners {
                l.after_save_checkpoint(self);
            }
        }
        Ok(())
    }

    /// Delete the marker, then both directories. Calling it again is a no-op.
    pub fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let (raw_dir, ema_dir) = checkpoint_directories(path)?;
        remove_any(&pair_marker_path(path)?)?;
        self.backend.remove(&raw_dir)?;
        self.backend.remove(&ema_dir)?;
        debug!(path = %path.display(), "removed checkpoint pair");
        Ok(())
    }

    /// Alias the pair at `path` as `link_path` (raw to raw, EMA to EMA), with its own marker.
    pub fn link(&self, path: impl AsRef<Path>, link_path: impl AsRef<Path>) -> Result<()> {
        let (path, link_path) = (path.as_ref(), link_path.as_ref());
        let marker = read_marker(&pair_marker_path(path)?)?;
        let (raw_dir, ema_dir) = checkpoint_directories(path)?;
        let (raw_link, ema_link) = checkpoint_directories(link_path)?;
        if resolve_parent(&raw_dir) == resolve_parent(&raw_link) {
            return Err(Error::Checkpoint(format!(
                "cannot link {} onto itself ({})",
                path.display(),
                link_path.display()
            )));
        }
        let link_marker = pair_marker_path(link_path)?;
        remove_any(&link_marker)?;
        self.backend.link(&raw_dir, &raw_link)?;
        self.backend.link(&ema_dir, &ema_link)?;
        let contents = PairMarker {
            global_step: marker.global_step,
            raw: dir_name(&raw_link),
            ema: dir_name(&ema_link),
        };
        write_atomic(&link_marker, &serde_json::to_vec_pretty(&contents)?)?;
        debug!(from = %path.display(), to = %link_path.display(), "linked checkpoint pair");
        Ok(())
    }

    /// Load `(params, params_ema, marker)`; a pair without its marker is rejected as torn.
    pub fn load_pair(&self, path: impl AsRef<Path>) -> Result<(ParamSet, ParamSet, PairMarker)> {
        let path = path.as_ref();
        let marker = read_marker(&pair_marker_path(path)?)?;
        let (raw_dir, ema_dir) = checkpoint_directories(path)?;
        let params = self.backend.load(&raw_dir)?;
        let params_ema = self.backend.load(&ema_dir)?;
        if !params.same_structure(&params_ema) {
            return Err(Error::Checkpoint(format!(
                "pair at {} has mismatched raw/EMA structure",
                path.display()
            )));
        }
        Ok((params, params_ema, marker))
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn read_marker(marker: &Path) -> Result<PairMarker> {
    match fs::read(marker) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::Checkpoint(format!(
            "no pair marker at {}; the pair is incomplete or torn",
            marker.display()
        ))),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn tree(v: f32) -> ParamSet {
        let mut p = ParamSet::new();
        p.insert("hidden/w", ArrayD::from_shape_fn(IxDyn(&[2, 3]), |i| v + i[0] as f32 - 0.5 * i[1] as f32));
        p.insert("out/b", ArrayD::from_elem(IxDyn(&[2]), -v));
        p
    }

    #[test]
    fn directory_stem_derivation() {
        let (raw, ema) = checkpoint_directories("/a/b/ckpt.tmp").unwrap();
        assert_eq!(raw, PathBuf::from("/a/b/ckpt"));
        assert_eq!(ema, PathBuf::from("/a/b/ckpt_ema"));
        assert_eq!(pair_marker_path("/a/b/ckpt.tmp").unwrap(), PathBuf::from("/a/b/ckpt.pair.json"));
        assert!(checkpoint_directories("/").is_err());
    }

    #[test]
    fn encode_decode_is_bit_exact() {
        let mut p = tree(0.1);
        p.insert("odd", ArrayD::from_shape_vec(IxDyn(&[3]), vec![f32::MIN_POSITIVE, -0.0, 1e30]).unwrap());
        let back = SafetensorsBackend::decode(&SafetensorsBackend::encode(&p).unwrap()).unwrap();
        for ((ka, a), (kb, b)) in p.iter().zip(back.iter()) {
            assert_eq!(ka, kb);
            assert_eq!(a.shape(), b.shape());
            for (x, y) in a.iter().zip(b.iter()) {
                assert_eq!(x.to_bits(), y.to_bits());
            }
        }
    }

    #[test]
    fn save_without_force_refuses_existing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("x");
        SafetensorsBackend.save(&dir, &tree(1.0), false).unwrap();
        assert!(SafetensorsBackend.save(&dir, &tree(2.0), false).is_err());
        SafetensorsBackend.save(&dir, &tree(2.0), true).unwrap();
        assert_eq!(SafetensorsBackend.load(&dir).unwrap(), tree(2.0));
    }

    #[test]
    fn missing_marker_is_a_torn_pair() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("c.ckpt");
        let mut co = CheckpointCoordinator::safetensors(true);
        co.save(&tree(1.0), &tree(2.0), &path, 3).unwrap();
        fs::remove_file(pair_marker_path(&path).unwrap()).unwrap();
        assert!(matches!(co.load_pair(&path), Err(Error::Checkpoint(_))));
    }

    struct Counter(Arc<AtomicUsize>);

    impl CheckpointListener for Counter {
        fn after_save_checkpoint(&self, coordinator: &CheckpointCoordinator) {
            assert!(coordinator.last_checkpoint_saved().is_some());
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn listeners_fire_only_on_primary() {
        let tmp = tempfile::tempdir().unwrap();
        for (primary, expected) in [(true, 2usize), (false, 0)] {
            let n = Arc::new(AtomicUsize::new(0));
            let mut co = CheckpointCoordinator::safetensors(primary);
            co.add_listener(Box::new(Counter(n.clone())));
            let path = tmp.path().join(format!("p{primary}.ckpt"));
            co.save(&tree(0.0), &tree(0.0), &path, 1).unwrap();
            co.save(&tree(1.0), &tree(1.0), &path, 2).unwrap();
            assert_eq!(n.load(Ordering::SeqCst), expected);
            assert_eq!(co.last_global_step_saved(), Some(2));
        }
    }

    #[test]
    fn link_aliases_both_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("epoch_1-step_10.ckpt");
        let best = tmp.path().join("best.ckpt");
        let mut co = CheckpointCoordinator::safetensors(true);
        co.save(&tree(1.0), &tree(2.0), &path, 10).unwrap();
        co.link(&path, &best).unwrap();
        let (raw, ema, marker) = co.load_pair(&best).unwrap();
        assert_eq!(raw, tree(1.0));
        assert_eq!(ema, tree(2.0));
        assert_eq!(marker.global_step, 10);
        assert_eq!(marker.ema, "best_ema");
    }

    #[test]
    fn linking_a_pair_onto_itself_is_refused_and_keeps_the_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("best.ckpt");
        let mut co = CheckpointCoordinator::safetensors(true);
        co.save(&tree(1.0), &tree(2.0), &path, 4).unwrap();
        assert!(matches!(co.link(&path, &path), Err(Error::Checkpoint(_))));
        // same stem, different extension and spelling of the parent
        let alias = tmp.path().join(".").join("best.pt");
        assert!(matches!(co.link(&path, &alias), Err(Error::Checkpoint(_))));
        let (raw, ema, marker) = co.load_pair(&path).unwrap();
        assert_eq!(raw, tree(1.0));
        assert_eq!(ema, tree(2.0));
        assert_eq!(marker.global_step, 4);
    }

    #[test]
    fn structure_mismatch_is_refused_before_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("m.ckpt");
        let mut other = tree(0.0);
        other.insert("extra", ArrayD::zeros(IxDyn(&[1])));
        let mut co = CheckpointCoordinator::safetensors(true);
        assert!(co.save(&tree(0.0), &other, &path, 0).is_err());
        assert!(!tmp.path().join("m").exists());
    }
}
