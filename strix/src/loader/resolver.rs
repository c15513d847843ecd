use std::path::{Path, PathBuf};

use fxhash::FxHashMap;
use rust_search::SearchBuilder;
use tracing::debug;

/// Resolves import path strings to files on disk. Relative paths try the
/// importing file's directory, the working directory, then each module
/// path; as a last resort the module paths are scanned once and indexed
/// by file name.
pub struct PathResolver {
	mod_path: Vec<PathBuf>,
	index: FxHashMap<String, Vec<PathBuf>>,
	indexed: bool,
}

impl PathResolver {
	pub fn new(mod_path: Vec<PathBuf>) -> Self {
		Self {
			mod_path,
			index: FxHashMap::default(),
			indexed: false,
		}
	}

	pub fn resolve(&mut self, from_dir: Option<&Path>, spec: &str) -> Option<PathBuf> {
		let path = Path::new(spec);
		if path.is_absolute() {
			return path.exists().then(|| path.to_path_buf());
		}

		if spec.starts_with('.') {
			let base = match from_dir {
				Some(dir) => dir.to_path_buf(),
				None => std::env::current_dir().ok()?,
			};
			let candidate = base.join(path);
			return candidate.exists().then_some(candidate);
		}

		let mut bases: Vec<PathBuf> = vec![];
		if let Some(dir) = from_dir {
			bases.push(dir.to_path_buf());
		}
		if let Ok(cwd) = std::env::current_dir() {
			bases.push(cwd);
		}
		bases.extend(self.mod_path.iter().cloned());
		for base in bases {
			let candidate = base.join(path);
			if candidate.exists() {
				return Some(candidate);
			}
		}

		self.ensure_index();
		let name = path.file_name()?.to_str()?;
		self.index.get(name)?.first().cloned()
	}

	fn ensure_index(&mut self) {
		if self.indexed {
			return;
		}
		self.indexed = true;
		for dir in &self.mod_path {
			debug!(dir = %dir.display(), "indexing module path");
			for entry in SearchBuilder::default().location(dir).depth(usize::MAX).build() {
				let path = PathBuf::from(&entry);
				if path.is_file() {
					if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
						self.index.entry(name.to_string()).or_default().push(path);
					}
				}
			}
		}
	}
}
