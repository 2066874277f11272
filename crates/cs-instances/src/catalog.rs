use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use cs_types::{validation_error, CsResult, Instance, InstanceId, InstanceSubset};

/// Registry of the instances found in an instance directory
#[derive(Debug, Clone, Default)]
pub struct InstanceCatalog {
    instances: BTreeMap<InstanceId, Instance>,
}

impl InstanceCatalog {
    /// Register every `*.mps` / `*.mps.gz` file directly under `instance_dir`.
    ///
    /// Reference solutions are looked up as `<id>.sol` or `<id>.sol.gz` in
    /// `solution_dir`. Two files mapping to the same id are rejected.
    pub fn scan(instance_dir: &Path, solution_dir: Option<&Path>) -> CsResult<Self> {
        let mut catalog = Self::default();

        let mut paths: Vec<PathBuf> = std::fs::read_dir(instance_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        for path in paths {
            let Some(id) = InstanceId::from_path(&path) else {
                debug!(path = ?path, "Skipping non-instance file");
                continue;
            };

            let mut instance = Instance::new(id.clone(), &path);
            if let Some(solution) = solution_dir.and_then(|dir| find_solution(dir, &id)) {
                instance = instance.with_solution(solution);
            }
            catalog.register(instance)?;
        }

        info!(
            directory = ?instance_dir,
            instances = catalog.len(),
            with_solution = catalog.instances.values().filter(|i| i.solution.is_some()).count(),
            "Scanned instance directory"
        );
        Ok(catalog)
    }

    pub fn from_instances(instances: impl IntoIterator<Item = Instance>) -> CsResult<Self> {
        let mut catalog = Self::default();
        for instance in instances {
            catalog.register(instance)?;
        }
        Ok(catalog)
    }

    fn register(&mut self, instance: Instance) -> CsResult<()> {
        if let Some(existing) = self.instances.get(&instance.id) {
            return Err(validation_error!(
                "Instance id {} is provided by both {:?} and {:?}",
                instance.id,
                existing.path,
                instance.path
            ));
        }
        self.instances.insert(instance.id.clone(), instance);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, id: &InstanceId) -> Option<&Instance> {
        self.instances.get(id)
    }

    /// Instances in ascending id order.
    pub fn instances(&self) -> Vec<Instance> {
        self.instances.values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<InstanceId> {
        self.instances.keys().cloned().collect()
    }

    /// Resolve a subset against the catalog, keeping the subset order.
    pub fn resolve(&self, subset: &InstanceSubset) -> CsResult<Vec<Instance>> {
        subset
            .iter()
            .map(|id| {
                self.instances
                    .get(id)
                    .cloned()
                    .ok_or_else(|| validation_error!("Subset instance {} is not in the catalog", id))
            })
            .collect()
    }
}

fn find_solution(dir: &Path, id: &InstanceId) -> Option<PathBuf> {
    ["sol", "sol.gz"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", id.as_str(), ext)))
        .find(|path| path.is_file())
}
