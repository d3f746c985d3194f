// ABOUTME: loads, mutates and persists one intent firewall rule document per package.
// ABOUTME: keeps a single-slot cache and saves the outgoing document before switching packages.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use blocker_common::{validate_package_name, ComponentCategory, ComponentIdentity};
use tracing::{debug, error, info, warn};

use crate::error::IfwError;
use crate::exec::RootShell;
use crate::ifw::fs::{remove_staging, write_staging, PrivilegedFiles};
use crate::ifw::rules::Rules;
use crate::paths::StoragePaths;

const RULE_EXTENSION: &str = ".xml";

/// The rule document of one package plus where it lives on disk.
pub struct RuleFile {
    package_name: String,
    rules: Rules,
    dirty: bool,
    dest_path: PathBuf,
    staging_path: PathBuf,
    paths: StoragePaths,
    files: Arc<PrivilegedFiles>,
}

impl fmt::Debug for RuleFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleFile")
            .field("package_name", &self.package_name)
            .field("filters", &self.rules.filter_count())
            .field("dirty", &self.dirty)
            .field("dest_path", &self.dest_path)
            .finish_non_exhaustive()
    }
}

impl RuleFile {
    fn load(
        package_name: &str,
        paths: &StoragePaths,
        staging_dir: &Path,
        files: Arc<PrivilegedFiles>,
    ) -> Result<Self, IfwError> {
        validate_package_name(package_name).map_err(|err| IfwError::InvalidPackage(err.message))?;

        let mut file = Self {
            package_name: package_name.to_string(),
            rules: Rules::default(),
            dirty: false,
            dest_path: paths.rule_file(package_name),
            staging_path: staging_dir.join(format!("{package_name}{RULE_EXTENSION}")),
            paths: paths.clone(),
            files,
        };
        file.rules = file.read_rules()?;
        Ok(file)
    }

    fn read_rules(&self) -> Result<Rules, IfwError> {
        remove_staging(&self.staging_path);
        if !self.files.exists(&self.dest_path)? {
            debug!(package = %self.package_name, "no rule file; starting empty");
            return Ok(Rules::default());
        }

        let content = self.files.read(&self.dest_path)?;
        if let Err(err) = write_staging(&self.staging_path, &content) {
            warn!(package = %self.package_name, error = %err, "could not keep a staging copy");
        }

        match Rules::parse(&content) {
            Ok(rules) => {
                debug!(package = %self.package_name, filters = rules.filter_count(), "loaded rule file");
                Ok(rules)
            }
            Err(err) => {
                warn!(
                    package = %self.package_name,
                    path = %self.dest_path.display(),
                    error = %err,
                    "rule file is malformed; starting from an empty document"
                );
                Ok(Rules::default())
            }
        }
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    pub fn dest_path(&self) -> &Path {
        &self.dest_path
    }

    /// Returns false when the component is already blocked in that section.
    pub fn add_component(&mut self, component_name: &str, category: ComponentCategory) -> Result<bool, IfwError> {
        let component = ComponentIdentity::new(self.package_name.as_str(), component_name);
        let added = self.rules.add(&component, category)?;
        if added {
            self.dirty = true;
            info!(%component, ?category, "added ifw filter");
        }
        Ok(added)
    }

    pub fn remove_component(&mut self, component_name: &str, category: ComponentCategory) -> Result<bool, IfwError> {
        let component = ComponentIdentity::new(self.package_name.as_str(), component_name);
        let removed = self.rules.remove(&component, category)?;
        if removed {
            self.dirty = true;
            info!(%component, ?category, "removed ifw filter");
        }
        Ok(removed)
    }

    /// True when the document holds changes that `save` has not persisted yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn get_component_enable_state(&self, component_name: &str) -> bool {
        self.get_component_enable_state_for(&self.package_name, component_name)
    }

    pub fn get_component_enable_state_for(&self, package_name: &str, component_name: &str) -> bool {
        self.rules
            .is_enabled(&ComponentIdentity::new(package_name, component_name))
    }

    /// Persists the document; a package without any filter has no rule file at all.
    pub fn save(&mut self) -> Result<(), IfwError> {
        self.rules.prune();
        if self.rules.is_empty() {
            self.delete_checked(&self.dest_path)?;
            remove_staging(&self.staging_path);
            self.dirty = false;
            info!(package = %self.package_name, "no filters left; rule file removed");
            return Ok(());
        }

        let xml = self.rules.to_xml()?;
        write_staging(&self.staging_path, &xml)?;
        self.files.relocate(&self.staging_path, &self.dest_path)?;
        self.dirty = false;
        info!(
            package = %self.package_name,
            filters = self.rules.filter_count(),
            "saved ifw rules"
        );
        Ok(())
    }

    /// Deletes this package's rule file and empties the in-memory document.
    pub fn clear(&mut self) -> Result<(), IfwError> {
        let name = self.package_name.clone();
        self.clear_named(&name)
    }

    /// Deletes `<ifw folder>/<name>` (`.xml` is appended when missing).
    pub fn clear_named(&mut self, name: &str) -> Result<(), IfwError> {
        let file_name = if name.ends_with(RULE_EXTENSION) {
            name.to_string()
        } else {
            format!("{name}{RULE_EXTENSION}")
        };
        let path = self.paths.ifw_folder().join(&file_name);
        if name.contains('/') || name.contains("..") {
            error!(name, "rule file name escapes the ifw folder");
            return Err(IfwError::PathSafetyViolation(path));
        }

        self.delete_checked(&path)?;
        if path == self.dest_path {
            self.rules = Rules::default();
            self.dirty = false;
            remove_staging(&self.staging_path);
        }
        Ok(())
    }

    /// Drops unsaved changes and reads the rule file again.
    pub fn reload(&mut self) -> Result<(), IfwError> {
        self.rules = self.read_rules()?;
        self.dirty = false;
        Ok(())
    }

    fn delete_checked(&self, path: &Path) -> Result<(), IfwError> {
        if !self.paths.is_inside_ifw_folder(path) {
            error!(path = %path.display(), "refusing to delete outside the ifw folder");
            return Err(IfwError::PathSafetyViolation(path.to_path_buf()));
        }
        self.files.delete(path)
    }
}

pub type SharedRuleFile = Arc<Mutex<RuleFile>>;

#[derive(Default)]
struct Slot {
    current: Option<(String, SharedRuleFile)>,
    // Evicted documents that callers may still hold; reopening hands the same instance back.
    evicted: HashMap<String, Weak<Mutex<RuleFile>>>,
}

/// Intent firewall rule store keyed by package name.
///
/// At most one document per package is alive at a time. Closures passed to
/// `with_rules` must not call back into the store.
pub struct IfwStore {
    paths: StoragePaths,
    staging_dir: PathBuf,
    files: Arc<PrivilegedFiles>,
    slot: Mutex<Slot>,
}

impl IfwStore {
    pub fn new(paths: StoragePaths, staging_dir: PathBuf, shell: Arc<RootShell>) -> Self {
        Self {
            paths,
            staging_dir,
            files: Arc::new(PrivilegedFiles::new(shell)),
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// Returns the cached document for `package_name`, loading it (and evicting any other package) if needed.
    ///
    /// Unsaved changes of the evicted document are saved first; when that
    /// save fails the eviction is refused and the error returned.
    pub fn open(&self, package_name: &str) -> Result<SharedRuleFile, IfwError> {
        self.acquire(package_name).map(|(file, _)| file)
    }

    /// Like `open`, also telling whether the document was just read from disk.
    fn acquire(&self, package_name: &str) -> Result<(SharedRuleFile, bool), IfwError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached, file)) = slot.current.as_ref() {
            if cached == package_name {
                return Ok((Arc::clone(file), false));
            }

            let mut outgoing = lock(file);
            if outgoing.is_dirty() {
                info!(package = %cached, "saving pending rules before switching packages");
                outgoing.save()?;
            }
        }

        slot.evicted.retain(|_, file| file.strong_count() > 0);
        let (file, fresh) = match slot.evicted.remove(package_name).and_then(|file| file.upgrade()) {
            Some(file) => {
                debug!(package = package_name, "reusing a rule document still held by a caller");
                (file, false)
            }
            None => {
                let file = RuleFile::load(package_name, &self.paths, &self.staging_dir, Arc::clone(&self.files))?;
                (Arc::new(Mutex::new(file)), true)
            }
        };

        if let Some((evicted, outgoing)) = slot.current.take() {
            debug!(evicted = %evicted, requested = package_name, "replacing cached rule document");
            slot.evicted.insert(evicted, Arc::downgrade(&outgoing));
        }
        slot.current = Some((package_name.to_string(), Arc::clone(&file)));
        Ok((file, fresh))
    }

    /// Runs `f` with the package's document locked.
    pub fn with_rules<T>(
        &self,
        package_name: &str,
        f: impl FnOnce(&mut RuleFile) -> Result<T, IfwError>,
    ) -> Result<T, IfwError> {
        let file = self.open(package_name)?;
        let mut guard = lock(&file);
        f(&mut guard)
    }

    /// Empties the slot; a document a caller still holds stays the live instance.
    pub fn reset_cache(&self) {
        debug!("reset ifw cache");
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((package_name, file)) = slot.current.take() {
            slot.evicted.insert(package_name, Arc::downgrade(&file));
        }
    }

    pub fn add(&self, component: &ComponentIdentity, category: ComponentCategory) -> Result<bool, IfwError> {
        self.with_rules(&component.package_name, |file| {
            file.add_component(&component.component_name, category)
        })
    }

    pub fn remove(&self, component: &ComponentIdentity, category: ComponentCategory) -> Result<bool, IfwError> {
        self.with_rules(&component.package_name, |file| {
            file.remove_component(&component.component_name, category)
        })
    }

    pub fn get_component_enable_state(&self, package_name: &str, component_name: &str) -> Result<bool, IfwError> {
        self.with_rules(package_name, |file| {
            Ok(file.get_component_enable_state(component_name))
        })
    }

    pub fn save(&self, package_name: &str) -> Result<(), IfwError> {
        self.with_rules(package_name, RuleFile::save)
    }

    pub fn clear(&self, package_name: &str) -> Result<(), IfwError> {
        self.with_rules(package_name, RuleFile::clear)
    }

    /// Discards unsaved changes; a package that was not cached is simply loaded.
    pub fn reload(&self, package_name: &str) -> Result<(), IfwError> {
        let (file, fresh) = self.acquire(package_name)?;
        if !fresh {
            lock(&file).reload()?;
        }
        Ok(())
    }

    /// Blocks every entry, saving once per package; returns how many filters were added.
    pub fn add_all(
        &self,
        entries: &[(ComponentIdentity, ComponentCategory)],
        on_each: impl FnMut(&ComponentIdentity),
    ) -> Result<usize, IfwError> {
        self.apply_all(entries, on_each, RuleFile::add_component)
    }

    /// Unblocks every entry, saving once per package; returns how many filters were removed.
    pub fn remove_all(
        &self,
        entries: &[(ComponentIdentity, ComponentCategory)],
        on_each: impl FnMut(&ComponentIdentity),
    ) -> Result<usize, IfwError> {
        self.apply_all(entries, on_each, RuleFile::remove_component)
    }

    fn apply_all(
        &self,
        entries: &[(ComponentIdentity, ComponentCategory)],
        mut on_each: impl FnMut(&ComponentIdentity),
        op: fn(&mut RuleFile, &str, ComponentCategory) -> Result<bool, IfwError>,
    ) -> Result<usize, IfwError> {
        let mut by_package: BTreeMap<&str, Vec<&(ComponentIdentity, ComponentCategory)>> = BTreeMap::new();
        for entry in entries {
            by_package
                .entry(entry.0.package_name.as_str())
                .or_default()
                .push(entry);
        }

        let mut changed = 0;
        for (package_name, group) in by_package {
            self.with_rules(package_name, |file| {
                for (component, category) in group {
                    if !category.supports_ifw() {
                        debug!(%component, "providers cannot be covered by ifw rules; skipping");
                        continue;
                    }
                    if op(file, &component.component_name, *category)? {
                        changed += 1;
                    }
                    on_each(component);
                }
                file.save()
            })?;
        }
        Ok(changed)
    }
}

fn lock(file: &Mutex<RuleFile>) -> MutexGuard<'_, RuleFile> {
    file.lock().unwrap_or_else(PoisonError::into_inner)
}
