use std::sync::{Arc, RwLock};
use anyhow::bail;
use tracing::{debug, error, info, warn};
use crate::descriptor::send::SendDescriptor;
use crate::error::{ErrorCode, Pt2PtResult};
use crate::path::{Path, PathId};
use crate::Rank;

/// The registered paths, in order of preference
#[derive(Default)]
pub struct PathContainer {
    paths: RwLock<Vec<Arc<dyn Path>>>,
}

impl PathContainer {
    pub fn register(&self, path: Arc<dyn Path>) -> anyhow::Result<()> {
        let mut paths = self.paths.write().unwrap();
        if paths.iter().any(|p| p.id() == path.id()) {
            bail!("a path with id {} is registered already", path.id());
        }
        info!("registering {}", path.id());
        paths.push(path);
        Ok(())
    }

    pub fn get(&self, id: PathId) -> Option<Arc<dyn Path>> {
        self.paths.read().unwrap()
            .iter()
            .find(|p| p.id() == id)
            .cloned()
    }

    pub fn active_paths(&self) -> Vec<Arc<dyn Path>> {
        self.paths.read().unwrap()
            .iter()
            .filter(|p| p.is_active())
            .cloned()
            .collect()
    }

    /// The first active path that can reach `dest` and is not excluded. Running out of paths is
    ///  fatal.
    pub fn select(&self, dest: Rank, exclude: &[PathId]) -> Pt2PtResult<Arc<dyn Path>> {
        let selected = self.paths.read().unwrap()
            .iter()
            .find(|p| p.is_active() && !exclude.contains(&p.id()) && p.can_reach(dest))
            .cloned();

        match selected {
            Some(path) => Ok(path),
            None => {
                error!("no usable path to {} (excluded: {:?})", dest, exclude);
                Err(ErrorCode::Fatal)
            }
        }
    }

    /// Binds a message to the best usable path and initializes it for that path
    pub fn bind_message(&self, desc: &mut SendDescriptor) -> Pt2PtResult<Arc<dyn Path>> {
        loop {
            let path = self.select(desc.dest, &desc.failed_paths)?;
            match path.bind(desc).and_then(|_| path.init(desc)) {
                Ok(()) => {
                    debug!("message to {} bound to {}", desc.dest, path.id());
                    return Ok(path);
                }
                Err(ErrorCode::BadPath) => {
                    warn!("{} refused message to {} - trying next path", path.id(), desc.dest);
                    path.unbind(desc);
                    desc.failed_paths.push(path.id());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Moves a message off its current path to a different one. Fragments that were sent on the
    ///  old path but not acknowledged are sent again, with their original sequence numbers.
    pub fn failover(&self, desc: &mut SendDescriptor) -> Pt2PtResult<Arc<dyn Path>> {
        if let Some(old_id) = desc.path {
            warn!("failing over message to {} from {}", desc.dest, old_id);
            match self.get(old_id) {
                Some(old) => old.unbind(desc),
                None => {
                    desc.requeue_unacked();
                    desc.path = None;
                }
            }
            if !desc.failed_paths.contains(&old_id) {
                desc.failed_paths.push(old_id);
            }
        }
        self.bind_message(desc)
    }
}
