use crate::ingress::IngressEntry;
use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use mlua::{Function, Lua, LuaSerdeExt, Table, Value as LuaValue};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use walkdir::WalkDir;

/// The read-mostly context snapshot handed to every extension call. Alias
/// and port maps are empty while converters run and populated before any
/// transform or ingress rewriter sees them.
#[derive(Debug, Default, Serialize)]
pub struct ContextSnapshot {
    pub aliases: BTreeMap<String, String>,
    /// Keyed `"service/port-name-or-number"`.
    pub service_ports: BTreeMap<String, u16>,
    pub volume_root: String,
    pub ingress_types: IndexMap<String, String>,
    pub project: Value,
    /// kind -> name -> manifest body.
    pub manifests: BTreeMap<String, BTreeMap<String, Value>>,
}

/// What a converter call returned. `services` present makes this a
/// provider result; detection is by key presence, never by type identity,
/// so extensions bundling their own helper tables still interoperate.
#[derive(Debug, Default, Deserialize)]
pub struct ConverterOutcome {
    #[serde(default)]
    pub manifests: Vec<Value>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub services: Option<IndexMap<String, Value>>,
    #[serde(default)]
    pub ingress: Vec<IngressEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TransformOutcome {
    #[serde(default)]
    pub services: Option<IndexMap<String, Value>>,
    #[serde(default)]
    pub ingress: Option<Vec<IngressEntry>>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

pub struct ConverterExt {
    pub extension: String,
    pub kinds: HashSet<String>,
    pub priority: i64,
    state: usize,
    function: Function,
}

pub struct TransformExt {
    pub extension: String,
    pub priority: i64,
    state: usize,
    function: Function,
}

pub struct RewriterExt {
    pub extension: String,
    pub name: String,
    pub priority: i64,
    state: usize,
    match_function: Function,
    rewrite_function: Function,
}

/// Priority-ordered registries of Lua extensions. Empty by default: all
/// converter, transform and rewriter behaviour flows through here, nothing
/// is hard-wired into the pipeline.
#[derive(Default)]
pub struct ExtensionRegistry {
    states: Vec<Lua>,
    pub converters: Vec<ConverterExt>,
    pub transforms: Vec<TransformExt>,
    pub rewriters: Vec<RewriterExt>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.lua` source unit under `dir`: leaf files one level
    /// deep, or files within a subdirectory one level deep. A unit that
    /// fails to load is dropped with a warning, the rest keep working.
    pub async fn load_dir(&mut self, dir: &Path, warnings: &mut Vec<String>) -> Result<()> {
        if !dir.is_dir() {
            return Err(anyhow!("extensions dir {} is not readable", dir.display()));
        }
        let mut paths = Vec::new();
        for entry in WalkDir::new(dir)
            .min_depth(1)
            .max_depth(2)
            .sort_by_file_name()
        {
            let entry = entry.context("Failed to walk extensions dir")?;
            if entry.file_type().is_file()
                && entry.path().extension().is_some_and(|ext| ext == "lua")
            {
                paths.push(entry.path().to_path_buf());
            }
        }
        for path in paths {
            let name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            match tokio::fs::read_to_string(&path).await {
                Ok(code) => self.register_source(&name, &code, warnings),
                Err(err) => warnings.push(format!(
                    "extension {} failed to load: {}",
                    path.display(),
                    err
                )),
            }
        }
        Ok(())
    }

    /// Evaluate one extension source unit and classify whatever it returns
    /// by capability set. Load failures become warnings.
    pub fn register_source(&mut self, name: &str, code: &str, warnings: &mut Vec<String>) {
        let lua = Lua::new();
        let state = self.states.len();
        match self.evaluate(&lua, state, name, code) {
            Ok(count) if count > 0 => {
                self.states.push(lua);
                self.sort();
            }
            Ok(_) => warnings.push(format!(
                "extension {} defines no converter, transform or ingress rewriter",
                name
            )),
            Err(err) => {
                // drop anything a partially evaluated script registered
                self.converters.retain(|c| c.state != state);
                self.transforms.retain(|t| t.state != state);
                self.rewriters.retain(|r| r.state != state);
                warnings.push(format!("extension {} failed to load: {:#}", name, err));
            }
        }
    }

    fn evaluate(&mut self, lua: &Lua, state: usize, name: &str, code: &str) -> Result<usize> {
        let exports: LuaValue = lua
            .load(code)
            .set_name(name)
            .eval()
            .map_err(|err| anyhow!("{}", err))?;
        let LuaValue::Table(table) = exports else {
            return Err(anyhow!("script must return a table"));
        };
        if is_extension_table(&table)? {
            return Ok(self.classify(state, name, &table)? as usize);
        }
        let mut count = 0;
        for value in table.sequence_values::<Table>() {
            let entry = value.map_err(|err| anyhow!("{}", err))?;
            if self.classify(state, name, &entry)? {
                count += 1;
            }
        }
        Ok(count)
    }

    fn classify(&mut self, state: usize, name: &str, table: &Table) -> Result<bool> {
        let priority: i64 = get(table, "priority")?.unwrap_or(100);
        let kinds: Option<Vec<String>> = get(table, "kinds")?;
        let convert: Option<Function> = get(table, "convert")?;
        let transform: Option<Function> = get(table, "transform")?;
        let rewriter_name: Option<String> = get(table, "name")?;
        let match_function: Option<Function> = get(table, "match")?;
        let rewrite: Option<Function> = get(table, "rewrite")?;

        if let (Some(kinds), Some(function)) = (kinds.clone(), convert) {
            self.converters.push(ConverterExt {
                extension: name.to_string(),
                kinds: kinds.into_iter().collect(),
                priority,
                state,
                function,
            });
            return Ok(true);
        }
        if let (Some(function), None) = (transform, kinds.as_ref()) {
            self.transforms.push(TransformExt {
                extension: name.to_string(),
                priority,
                state,
                function,
            });
            return Ok(true);
        }
        if let (Some(rewriter_name), Some(match_function), Some(rewrite_function)) =
            (rewriter_name, match_function, rewrite)
        {
            self.rewriters.push(RewriterExt {
                extension: name.to_string(),
                name: rewriter_name,
                priority,
                state,
                match_function,
                rewrite_function,
            });
            return Ok(true);
        }
        Ok(false)
    }

    fn sort(&mut self) {
        self.converters.sort_by_key(|c| c.priority);
        self.transforms.sort_by_key(|t| t.priority);
        self.rewriters.sort_by_key(|r| r.priority);
    }

    /// Union of every kind claimed by a converter.
    pub fn claimed_kinds(&self) -> HashSet<String> {
        self.converters
            .iter()
            .flat_map(|c| c.kinds.iter().cloned())
            .collect()
    }

    pub fn converters_for(&self, kind: &str) -> Vec<&ConverterExt> {
        self.converters
            .iter()
            .filter(|c| c.kinds.contains(kind))
            .collect()
    }

    pub fn rewriters_named(&self, name: &str) -> Vec<&RewriterExt> {
        self.rewriters.iter().filter(|r| r.name == name).collect()
    }

    pub fn call_converter(
        &self,
        converter: &ConverterExt,
        manifest: &Value,
        ctx: &ContextSnapshot,
    ) -> Result<Option<ConverterOutcome>> {
        let lua = &self.states[converter.state];
        let manifest_value = lua.to_value(manifest)?;
        let ctx_value = lua.to_value(ctx)?;
        let result: LuaValue = converter.function.call((manifest_value, ctx_value))?;
        if let LuaValue::Nil = result {
            return Ok(None);
        }
        let outcome: ConverterOutcome = lua.from_value(result)?;
        Ok(Some(outcome))
    }

    pub fn call_transform(
        &self,
        transform: &TransformExt,
        services: &IndexMap<String, Value>,
        ingress: &[IngressEntry],
        ctx: &ContextSnapshot,
    ) -> Result<Option<TransformOutcome>> {
        let lua = &self.states[transform.state];
        let services_value = lua.to_value(services)?;
        let ingress_value = lua.to_value(ingress)?;
        let ctx_value = lua.to_value(ctx)?;
        let result: LuaValue = transform
            .function
            .call((services_value, ingress_value, ctx_value))?;
        if let LuaValue::Nil = result {
            return Ok(None);
        }
        let outcome: TransformOutcome = lua.from_value(result)?;
        Ok(Some(outcome))
    }

    pub fn call_rewriter_match(&self, rewriter: &RewriterExt, manifest: &Value) -> Result<bool> {
        let lua = &self.states[rewriter.state];
        let manifest_value = lua.to_value(manifest)?;
        let matched: bool = rewriter.match_function.call(manifest_value)?;
        Ok(matched)
    }

    /// Run a rewriter; accepts a single entry table or a sequence of them.
    pub fn call_rewriter(
        &self,
        rewriter: &RewriterExt,
        manifest: &Value,
        ctx: &ContextSnapshot,
    ) -> Result<Vec<IngressEntry>> {
        let lua = &self.states[rewriter.state];
        let manifest_value = lua.to_value(manifest)?;
        let ctx_value = lua.to_value(ctx)?;
        let result: LuaValue = rewriter
            .rewrite_function
            .call((manifest_value, ctx_value))?;
        if let LuaValue::Nil = result {
            return Ok(Vec::new());
        }
        let single = match &result {
            LuaValue::Table(table) => table.contains_key("host")?,
            _ => false,
        };
        if single {
            Ok(vec![lua.from_value(result)?])
        } else {
            let entries: Vec<IngressEntry> = lua.from_value(result)?;
            Ok(entries)
        }
    }
}

fn get<V: mlua::FromLua>(table: &Table, key: &str) -> Result<Option<V>> {
    table
        .get::<Option<V>>(key)
        .map_err(|err| anyhow!("field {}: {}", key, err))
}

/// A table is a single extension when it carries any capability field
/// directly; otherwise it is treated as a sequence of extensions.
fn is_extension_table(table: &Table) -> mlua::Result<bool> {
    Ok(table.contains_key("convert")?
        || table.contains_key("transform")?
        || table.contains_key("rewrite")?)
}

/// Bundled transform adding one fix-permissions init service per service
/// that mounts named volumes. Registered only when the project config asks
/// for it; goes through the normal registry like any other extension.
const FIX_PERMISSIONS_LUA: &str = r#"
local function named_volume_target(mount)
    local source, target = mount:match("^([^:]+):([^:]+)")
    if not source or not target then
        return nil
    end
    local head = source:sub(1, 1)
    if head == "/" or head == "." or head == "~" then
        return nil
    end
    return target
end

return {
    priority = 50,
    transform = function(services, ingress, ctx)
        local out = {}
        local added = false
        for name, service in pairs(services) do
            out[name] = service
        end
        for name, service in pairs(services) do
            local targets = {}
            for _, mount in ipairs(service.volumes or {}) do
                local target = named_volume_target(mount)
                if target then
                    targets[#targets + 1] = target
                end
            end
            local helper = name .. "-fix-perms"
            if #targets > 0 and not name:match("%-fix%-perms$") and not out[helper] then
                out[helper] = {
                    image = "busybox:1.36",
                    command = { "sh", "-c", "chown -R 1000:1000 " .. table.concat(targets, " ") },
                    volumes = service.volumes,
                }
                added = true
            end
        end
        if added then
            return { services = out }
        end
        return nil
    end,
}
"#;

impl ExtensionRegistry {
    pub fn register_fix_permissions(&mut self, warnings: &mut Vec<String>) {
        self.register_source("fix-permissions", FIX_PERMISSIONS_LUA, warnings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_capability_set() {
        let mut registry = ExtensionRegistry::new();
        let mut warnings = Vec::new();
        registry.register_source(
            "mixed",
            r#"
return {
    { kinds = {"Middleware"}, convert = function(m, ctx) return nil end, priority = 10 },
    { transform = function(s, i, ctx) return nil end },
    { name = "nginx", match = function(m) return true end,
      rewrite = function(m, ctx) return { host = "a", routes = {} } end },
}
"#,
            &mut warnings,
        );
        assert!(warnings.is_empty());
        assert_eq!(registry.converters.len(), 1);
        assert_eq!(registry.transforms.len(), 1);
        assert_eq!(registry.rewriters.len(), 1);
        assert_eq!(registry.converters[0].priority, 10);
        assert!(registry.claimed_kinds().contains("Middleware"));
    }

    #[test]
    fn test_load_failure_is_contained() {
        let mut registry = ExtensionRegistry::new();
        let mut warnings = Vec::new();
        registry.register_source("broken", "return {", &mut warnings);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("broken"));
        registry.register_source(
            "fine",
            "return { transform = function(s, i, c) return nil end }",
            &mut warnings,
        );
        assert_eq!(registry.transforms.len(), 1);
    }

    #[test]
    fn test_converter_roundtrip_and_provider_detection() {
        let mut registry = ExtensionRegistry::new();
        let mut warnings = Vec::new();
        registry.register_source(
            "provider",
            r#"
return {
    kinds = {"Database"},
    convert = function(manifest, ctx)
        return {
            manifests = {
                { kind = "Secret", metadata = { name = manifest.metadata.name } },
            },
            services = {
                [manifest.metadata.name] = { image = "postgres:16" },
            },
            warnings = { "made one up" },
        }
    end,
}
"#,
            &mut warnings,
        );
        assert!(warnings.is_empty());
        let manifest: Value =
            serde_yaml::from_str("kind: Database\nmetadata: {name: main-db}").unwrap();
        let ctx = ContextSnapshot::default();
        let outcome = registry
            .call_converter(&registry.converters[0], &manifest, &ctx)
            .unwrap()
            .unwrap();
        assert_eq!(outcome.manifests.len(), 1);
        assert_eq!(outcome.warnings, vec!["made one up".to_string()]);
        let services = outcome.services.expect("provider result carries services");
        assert!(services.contains_key("main-db"));
    }

    #[test]
    fn test_runtime_failure_surfaces_as_error() {
        let mut registry = ExtensionRegistry::new();
        let mut warnings = Vec::new();
        registry.register_source(
            "angry",
            r#"return { kinds = {"X"}, convert = function(m, c) error("boom") end }"#,
            &mut warnings,
        );
        let manifest: Value = serde_yaml::from_str("kind: X\nmetadata: {name: a}").unwrap();
        let result =
            registry.call_converter(&registry.converters[0], &manifest, &ContextSnapshot::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_priority_ordering_is_ascending() {
        let mut registry = ExtensionRegistry::new();
        let mut warnings = Vec::new();
        registry.register_source(
            "late",
            r#"return { transform = function(s, i, c) return nil end, priority = 200 }"#,
            &mut warnings,
        );
        registry.register_source(
            "early",
            r#"return { transform = function(s, i, c) return nil end, priority = 5 }"#,
            &mut warnings,
        );
        assert_eq!(registry.transforms[0].extension, "early");
        assert_eq!(registry.transforms[1].extension, "late");
    }
}
