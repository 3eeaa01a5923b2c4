// src/packager.rs
//
// =============================================================================
// REPX-LAB: LAB PACKAGER
// =============================================================================
//
// Turns a `ResolvedLab` into the directory tree the execution engine reads:
//
//   <lab-root>/
//     lab/lab-metadata.json          {labId, labVersion, metadataRef, files}
//     revision/metadata.json         root metadata
//     revision/<h>-metadata-<run>.json  one per run
//     jobs/<job-id>/bin/<exe>        -> store
//     host-tools/<toolset>/bin/<t>   -> store (one toolset per lab)
//     images/<image>/layers/<l>.tar  -> store
//     store/<sha256>                 every distinct content, once
//
// The tree is assembled in a sibling directory and renamed into place only
// after every step succeeded, so a failed build leaves nothing behind.

use crate::config::BuildConfig;
use crate::core::{InputMapping, Job, JobBody, JobId, JOB_HASH_LEN};
use crate::error::{quoted, BuildError, Result};
use crate::lab::{ResolvedLab, ResolvedRun};
use crate::provenance::{sha256_bytes, sha256_file, ArtifactStore, Notary, STORE_DIR};
use crate::resources::ResourceHint;
use crate::scatter::{PhasePlan, ScatterGatherPlan};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const LAB_METADATA: &str = "lab/lab-metadata.json";
pub const ROOT_METADATA: &str = "revision/metadata.json";
pub const REVISION_DIR: &str = "revision";
pub const HOST_TOOLS_DIR: &str = "host-tools";

/// `revision/<hash>-metadata-<run>.json`. Readers find a run's metadata by
/// the `metadata-<run>.json` suffix.
pub fn run_metadata_path(hash: &str, run: &str) -> String {
    format!("{REVISION_DIR}/{hash}-metadata-{run}.json")
}

// ============================================================================
// 1. MANIFEST TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabManifest {
    pub lab_id: String,
    pub lab_version: String,
    pub metadata_ref: String,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone)]
pub struct PackageReport {
    pub lab_root: PathBuf,
    pub lab_id: String,
    pub jobs: usize,
    pub files: usize,
    pub store_entries: usize,
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub lab_id: String,
    pub checked: usize,
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

/// Packages `lab` into `config.out`.
pub fn package(lab: &ResolvedLab, config: &BuildConfig) -> Result<PackageReport> {
    let out = &config.out;
    if out.exists() && !config.force {
        return Err(BuildError::validation(
            format!("lab output {}", out.display()),
            "directory already exists (use --force to replace it)",
        ));
    }

    let staging = staging_dir(out);
    if staging.exists() {
        fs::remove_dir_all(&staging)
            .map_err(|e| BuildError::io(format!("clearing {}", staging.display()), e))?;
    }
    fs::create_dir_all(&staging)
        .map_err(|e| BuildError::io(format!("creating {}", staging.display()), e))?;

    let built = Packer::new(lab, config, &staging).and_then(|p| p.pack());
    let (lab_id, jobs, files) = match built {
        Ok(v) => v,
        Err(e) => {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
    };

    if out.exists() {
        fs::remove_dir_all(out).map_err(|e| BuildError::io(format!("replacing {}", out.display()), e))?;
    }
    fs::rename(&staging, out).map_err(|e| BuildError::io(format!("moving lab into {}", out.display()), e))?;

    let store_entries = fs::read_dir(out.join(STORE_DIR))
        .map(|d| d.count())
        .unwrap_or(0);

    log::info!(
        "Lab {} written to {} ({} jobs, {} files, {} store entries)",
        &lab_id[..12],
        out.display(),
        jobs,
        files,
        store_entries
    );

    Ok(PackageReport {
        lab_root: out.clone(),
        lab_id,
        jobs,
        files,
        store_entries,
    })
}

fn staging_dir(out: &Path) -> PathBuf {
    let name = out
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "lab".to_string());
    out.with_file_name(format!(".{name}.partial"))
}

// ============================================================================
// 3. THE PACKER
// ============================================================================

struct Packer<'a> {
    lab: &'a ResolvedLab,
    config: &'a BuildConfig,
    root: &'a Path,
    store: ArtifactStore,
    /// tool name -> store hash
    tool_hashes: BTreeMap<String, String>,
    /// image name -> image hash
    image_hashes: BTreeMap<String, String>,
}

impl<'a> Packer<'a> {
    fn new(lab: &'a ResolvedLab, config: &'a BuildConfig, root: &'a Path) -> Result<Self> {
        Ok(Self {
            lab,
            config,
            root,
            store: ArtifactStore::new(root)?,
            tool_hashes: BTreeMap::new(),
            image_hashes: BTreeMap::new(),
        })
    }

    fn lab_version(&self) -> &str {
        self.config.lab_version.as_deref().unwrap_or(&self.lab.version)
    }

    /// Returns (labId, job count, manifest file count).
    fn pack(mut self) -> Result<(String, usize, usize)> {
        let lab = self.lab;
        let jobs = lab.unique_jobs();
        for job in jobs.values() {
            self.pack_job(job)?;
        }
        log::debug!("Packed {} unique job(s)", jobs.len());

        let host_tools = self.pack_toolset()?;
        let mut run_refs = Vec::with_capacity(lab.runs.len());
        for run in &lab.runs {
            run_refs.push(self.pack_run(run, &host_tools)?);
        }

        let root_meta = json!({
            "repx_version": env!("CARGO_PKG_VERSION"),
            "type": "root",
            "lab": { "name": lab.name, "version": self.lab_version() },
            "revision": self.config.revision,
            "runs": run_refs,
            "groups": lab.groups,
        });
        self.write_json(ROOT_METADATA, &root_meta)?;

        let manifest = self.manifest()?;
        let files = manifest.files.len();
        let lab_id = manifest.lab_id.clone();
        self.write_json(LAB_METADATA, &serde_json::to_value(&manifest).map_err(|e| BuildError::parse("lab manifest", e))?)?;
        Ok((lab_id, jobs.len(), files))
    }

    fn write_json(&self, rel: &str, value: &Value) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BuildError::io(format!("creating {}", parent.display()), e))?;
        }
        let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| BuildError::parse(rel, e))?;
        bytes.push(b'\n');
        fs::write(&path, bytes).map_err(|e| BuildError::io(format!("writing {}", path.display()), e))
    }

    // --- Jobs ---

    fn pack_job(&self, job: &Job) -> Result<()> {
        let base = PathBuf::from("jobs").join(job.id.as_str());
        for exe in executables(job) {
            let (hash, _) = self.store.put_bytes(exe.script.as_bytes(), true)?;
            self.store.link(&hash, base.join("bin").join(exe.file_name()))?;
        }
        if let JobBody::ScatterGather(plan) = &job.body {
            let mut doc = serde_json::to_vec_pretty(&plan.steps_metadata())
                .map_err(|e| BuildError::parse(format!("steps of job {}", job.id), e))?;
            doc.push(b'\n');
            let (hash, _) = self.store.put_bytes(&doc, false)?;
            self.store.link(&hash, base.join("steps.json"))?;
        }
        Ok(())
    }

    // --- Tools & images ---

    fn tool_hash(&mut self, name: &str) -> Result<String> {
        if let Some(h) = self.tool_hashes.get(name) {
            return Ok(h.clone());
        }
        let src = self.lab.tools.get(name).ok_or_else(|| {
            BuildError::definition(format!("tool '{name}'"), "required by a job but not declared")
        })?;
        let (hash, _) = self.store.put_file(src, true)?;
        self.tool_hashes.insert(name.to_string(), hash.clone());
        Ok(hash)
    }

    /// Links every tool any job needs under `host-tools/<toolset>/bin`.
    /// The directory exists even when no job needs a tool.
    fn pack_toolset(&mut self) -> Result<String> {
        let lab = self.lab;
        let names: BTreeSet<&str> = lab.runs.iter().flat_map(|r| r.tools()).collect();
        let mut members = BTreeMap::new();
        for name in names {
            members.insert(name.to_string(), self.tool_hash(name)?);
        }
        let toolset = hash_json(&members)?;
        let bin = PathBuf::from(HOST_TOOLS_DIR).join(&toolset).join("bin");
        let bin_abs = self.root.join(&bin);
        fs::create_dir_all(&bin_abs).map_err(|e| BuildError::io(format!("creating {}", bin_abs.display()), e))?;
        for (name, hash) in &members {
            self.store.link(hash, bin.join(name))?;
        }
        log::debug!("Toolset {} ({} tool(s))", &toolset[..12], members.len());
        Ok(toolset)
    }

    fn pack_image(&mut self, name: &str) -> Result<String> {
        if let Some(h) = self.image_hashes.get(name) {
            return Ok(h.clone());
        }
        let spec = self.lab.images.get(name).ok_or_else(|| {
            BuildError::definition(format!("image '{name}'"), "referenced by a run but not declared")
        })?;
        let mut layers = Vec::with_capacity(spec.layers.len());
        for layer in &spec.layers {
            let (hash, _) = self.store.put_file(layer, false)?;
            layers.push(hash);
        }
        let image_hash = hash_json(&layers)?;
        let base = PathBuf::from("images").join(&image_hash);
        for hash in &layers {
            self.store.link(hash, base.join("layers").join(format!("{hash}.tar")))?;
        }
        let manifest_rel = base.join("manifest.json");
        self.write_json(&manifest_rel.to_string_lossy(), &json!({ "layers": layers }))?;
        log::debug!("Image '{}' -> {} ({} layers)", name, &image_hash[..12], layers.len());
        self.image_hashes.insert(name.to_string(), image_hash.clone());
        Ok(image_hash)
    }

    // --- Runs ---

    /// Writes the run metadata and returns its path relative to the lab root.
    fn pack_run(&mut self, run: &ResolvedRun, host_tools: &str) -> Result<String> {
        let image = match &run.image {
            Some(name) => Some(self.pack_image(name)?),
            None => None,
        };

        let jobs: Map<String, Value> = run
            .jobs
            .iter()
            .map(|j| (j.id.to_string(), job_metadata(j)))
            .collect();
        let dependencies: Map<String, Value> = run
            .dependencies
            .iter()
            .map(|(name, kind)| (name.clone(), Value::String(kind.to_string())))
            .collect();

        let meta = json!({
            "type": "run",
            "name": run.name,
            "revision": self.config.revision,
            "containerized": run.containerized,
            "dependencies": dependencies,
            "image": image,
            "host_tools": host_tools,
            "terminal_jobs": run.terminal,
            "jobs": jobs,
        });

        let canonical = serde_json::to_vec(&meta).map_err(|e| BuildError::parse(format!("run '{}'", run.name), e))?;
        let rel = run_metadata_path(&sha256_bytes(&canonical)[..JOB_HASH_LEN], &run.name);
        self.write_json(&rel, &meta)?;
        Ok(rel)
    }

    // --- Manifest ---

    fn manifest(&self) -> Result<LabManifest> {
        let files = list_files(self.root)?;
        let lab_id = hash_json(&files)?;
        Ok(LabManifest {
            lab_id,
            lab_version: self.lab_version().to_string(),
            metadata_ref: ROOT_METADATA.to_string(),
            files,
        })
    }
}

/// One packaged executable of a job: a simple stage has `main`, a fan-out
/// stage has `scatter`, `step-<name>` per step and `gather`.
struct Executable<'a> {
    key: String,
    script: &'a str,
    inputs: &'a [InputMapping],
    outputs: &'a BTreeMap<String, String>,
    resources: &'a ResourceHint,
}

impl Executable<'_> {
    fn file_name(&self) -> String {
        ScatterGatherPlan::exe_name(&self.key)
    }

    fn metadata(&self) -> Value {
        json!({
            "path": format!("bin/{}", self.file_name()),
            "inputs": self.inputs.iter().map(InputMapping::to_metadata).collect::<Vec<_>>(),
            "outputs": self.outputs,
            "resource_hints": self.resources.to_metadata(),
        })
    }
}

fn phase_executable<'a>(key: String, phase: &'a PhasePlan) -> Executable<'a> {
    Executable {
        key,
        script: &phase.script,
        inputs: &phase.inputs,
        outputs: &phase.outputs,
        resources: &phase.resources,
    }
}

fn executables(job: &Job) -> Vec<Executable<'_>> {
    match &job.body {
        JobBody::Simple { script } => vec![Executable {
            key: "main".to_string(),
            script,
            inputs: &job.inputs,
            outputs: &job.outputs,
            resources: &job.resources,
        }],
        JobBody::ScatterGather(plan) => {
            let mut out = vec![phase_executable("scatter".to_string(), &plan.scatter)];
            for name in &plan.order {
                if let Some(step) = plan.steps.get(name) {
                    out.push(phase_executable(format!("step-{name}"), &step.phase));
                }
            }
            out.push(phase_executable("gather".to_string(), &plan.gather));
            out
        }
    }
}

fn job_metadata(job: &Job) -> Value {
    let executables: Map<String, Value> = executables(job)
        .iter()
        .map(|exe| (exe.key.clone(), exe.metadata()))
        .collect();
    json!({
        "name": job.name,
        "stage": job.stage,
        "version": job.version,
        "stage_type": job.stage_type().to_string(),
        "params": job.params,
        "effective_params": job.effective_params,
        "executables": executables,
        "resource_hints": job.resources.to_metadata(),
        "tools": job.tools,
    })
}

fn hash_json<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value).map_err(|e| BuildError::parse("content hash input", e))?;
    Ok(sha256_bytes(&bytes))
}

fn rel_string(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

/// Every file and link under `root` except the lab manifest, sorted, with
/// the checksum of the content it resolves to.
fn list_files(root: &Path) -> Result<Vec<FileEntry>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| BuildError::validation(format!("lab {}", root.display()), e.to_string()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Some(rel) = rel_string(root, entry.path()) else {
            continue;
        };
        if rel == LAB_METADATA {
            continue;
        }
        files.push(FileEntry {
            sha256: sha256_file(entry.path())?,
            path: rel,
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

// ============================================================================
// 4. VERIFICATION
// ============================================================================

/// Re-hashes every manifest entry of a packaged lab and checks the lab id.
/// All problems are reported together.
pub fn verify(lab_root: impl AsRef<Path>) -> Result<VerifyReport> {
    let root = lab_root.as_ref();
    let manifest_path = root.join(LAB_METADATA);
    let raw = fs::read(&manifest_path)
        .map_err(|e| BuildError::io(format!("reading {}", manifest_path.display()), e))?;
    let manifest: LabManifest = serde_json::from_slice(&raw)
        .map_err(|e| BuildError::parse(manifest_path.display().to_string(), e))?;

    let mut problems = Vec::new();
    for entry in &manifest.files {
        if let Err(e) = Notary::verify(&root.join(&entry.path), &entry.sha256) {
            problems.push(format!("{}: {}", entry.path, detail_of(&e)));
        }
    }

    let listed: BTreeSet<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    let present = list_files(root)?;
    let unlisted: Vec<&str> = present
        .iter()
        .map(|f| f.path.as_str())
        .filter(|p| !listed.contains(p))
        .collect();
    if !unlisted.is_empty() {
        problems.push(format!("files not in the manifest: {}", quoted(&unlisted)));
    }

    if hash_json(&manifest.files)? != manifest.lab_id {
        problems.push("labId does not match the file list".to_string());
    }

    if !problems.is_empty() {
        return Err(BuildError::validation(
            format!("lab {}", root.display()),
            format!("integrity check failed:\n  {}", problems.join("\n  ")),
        ));
    }

    log::info!("Lab {} verified ({} files)", manifest.lab_id, manifest.files.len());
    Ok(VerifyReport {
        lab_id: manifest.lab_id,
        checked: manifest.files.len(),
    })
}

fn detail_of(e: &BuildError) -> String {
    match e {
        BuildError::Validation { detail, .. } => detail.clone(),
        other => other.to_string(),
    }
}

/// Job ids packaged under `jobs/`.
pub fn packaged_jobs(lab_root: impl AsRef<Path>) -> Result<Vec<JobId>> {
    let dir = lab_root.as_ref().join("jobs");
    let mut ids: Vec<JobId> = fs::read_dir(&dir)
        .map_err(|e| BuildError::io(format!("listing {}", dir.display()), e))?
        .filter_map(|e| e.ok())
        .map(|e| JobId(e.file_name().to_string_lossy().into_owned()))
        .collect();
    ids.sort();
    Ok(ids)
}
