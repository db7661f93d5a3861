//! The environment-variable surface (spec §6), parsed once at
//! `Initialize` behind an [`EnvSource`] trait so tests can inject a
//! fake environment instead of touching real process state, mirroring
//! the teacher's `AnalysisConfig`/`WorkspaceConfig` split between a
//! plain data struct and the thing that populates it.

use std::collections::HashSet;

/// Whether the attached runtime is .NET Framework ("desktop") or
/// .NET/.NET Core ("core") — drives the version-comparison policy in
/// `AssemblyLoadFinished` and whether `IsAlreadyLoaded` can use an
/// interlocked primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Desktop,
    Core,
}

/// A source of named string values — `std::env::var` in production,
/// a fixed table in tests. Keeping this as a trait rather than calling
/// `std::env::var` directly is the only way `EngineConfig::load` stays
/// testable without mutating real process environment.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// An `EnvSource` backed by a fixed table, for tests and for any
/// non-OS-environment configuration source (e.g. a config file loaded
/// by the out-of-scope host binary).
#[derive(Debug, Default, Clone)]
pub struct FixedEnv(std::collections::HashMap<String, String>);

impl FixedEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

impl EnvSource for FixedEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// `std::env::var`-backed source for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// One variant per spec §6 knob, independent of which `EngineConfig`
/// field its parsed value ends up in. [`env_knob_name`] is the single
/// place that spells out the wire name, so `load` and any other reader
/// of the same knob (diagnostics, docs) can't drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvKnob {
    TraceEnabled,
    IncludeProcesses,
    ExcludeProcesses,
    DisabledIntegrations,
    DomainNeutralInstrumentation,
    EnableInlining,
    DisableOptimizations,
    DumpIlRewrites,
    Debug,
    NativeProfilerPathOverride,
    CallTargetEnabled,
    NetstandardEnabled,
    AzureFunctionsEnabled,
    AzureAppServicesAppPoolId,
    NgenEnabled,
}

/// The wire name of an environment knob, per spec §6.
pub fn env_knob_name(knob: EnvKnob) -> &'static str {
    match knob {
        EnvKnob::TraceEnabled => "TRACE_ENABLED",
        EnvKnob::IncludeProcesses => "INCLUDE_PROCESSES",
        EnvKnob::ExcludeProcesses => "EXCLUDE_PROCESSES",
        EnvKnob::DisabledIntegrations => "DISABLED_INTEGRATIONS",
        EnvKnob::DomainNeutralInstrumentation => "DOMAIN_NEUTRAL_INSTRUMENTATION",
        EnvKnob::EnableInlining => "ENABLE_INLINING",
        EnvKnob::DisableOptimizations => "DISABLE_OPTIMIZATIONS",
        EnvKnob::DumpIlRewrites => "DUMP_IL_REWRITES",
        EnvKnob::Debug => "DEBUG",
        EnvKnob::NativeProfilerPathOverride => "INTERNAL_TRACE_PROFILER_PATH",
        EnvKnob::CallTargetEnabled => "CALLTARGET_ENABLED",
        EnvKnob::NetstandardEnabled => "NETSTANDARD_ENABLED",
        EnvKnob::AzureFunctionsEnabled => "AZURE_FUNCTIONS_ENABLED",
        EnvKnob::AzureAppServicesAppPoolId => "AZURE_APP_SERVICES_APP_POOL_ID",
        EnvKnob::NgenEnabled => "NGEN_ENABLED",
    }
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn split_semicolons(value: &str) -> HashSet<String> {
    value.split(';').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

/// The parsed form of spec §6's environment-variable table. Parsed
/// once at `Initialize` and held immutable for the process lifetime —
/// spec §6's "no persisted state" extends to configuration itself.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub trace_enabled: bool,
    pub include_processes: HashSet<String>,
    pub exclude_processes: HashSet<String>,
    pub disabled_integrations: HashSet<String>,
    pub domain_neutral_instrumentation: bool,
    pub enable_inlining: bool,
    pub disable_optimizations: bool,
    pub dump_il_rewrites: bool,
    pub debug: bool,
    pub native_profiler_path_override: Option<String>,
    pub calltarget_enabled: bool,
    pub netstandard_enabled: bool,
    pub azure_functions_enabled: bool,
    pub azure_app_services: bool,
    pub ngen_enabled: bool,
}

impl EngineConfig {
    pub fn load(env: &dyn EnvSource) -> Self {
        let get = |knob: EnvKnob| env.get(env_knob_name(knob));
        Self {
            trace_enabled: get(EnvKnob::TraceEnabled).map(|v| is_truthy(&v)).unwrap_or(false),
            include_processes: get(EnvKnob::IncludeProcesses).map(|v| split_semicolons(&v)).unwrap_or_default(),
            exclude_processes: get(EnvKnob::ExcludeProcesses).map(|v| split_semicolons(&v)).unwrap_or_default(),
            disabled_integrations: get(EnvKnob::DisabledIntegrations).map(|v| split_semicolons(&v)).unwrap_or_default(),
            domain_neutral_instrumentation: get(EnvKnob::DomainNeutralInstrumentation).map(|v| is_truthy(&v)).unwrap_or(false),
            enable_inlining: get(EnvKnob::EnableInlining).map(|v| is_truthy(&v)).unwrap_or(true),
            disable_optimizations: get(EnvKnob::DisableOptimizations).map(|v| is_truthy(&v)).unwrap_or(false),
            dump_il_rewrites: get(EnvKnob::DumpIlRewrites).map(|v| is_truthy(&v)).unwrap_or(false),
            debug: get(EnvKnob::Debug).map(|v| is_truthy(&v)).unwrap_or(false),
            native_profiler_path_override: get(EnvKnob::NativeProfilerPathOverride),
            calltarget_enabled: get(EnvKnob::CallTargetEnabled).map(|v| is_truthy(&v)).unwrap_or(true),
            netstandard_enabled: get(EnvKnob::NetstandardEnabled).map(|v| is_truthy(&v)).unwrap_or(false),
            azure_functions_enabled: get(EnvKnob::AzureFunctionsEnabled).map(|v| is_truthy(&v)).unwrap_or(false),
            azure_app_services: get(EnvKnob::AzureAppServicesAppPoolId).is_some(),
            ngen_enabled: get(EnvKnob::NgenEnabled).map(|v| is_truthy(&v)).unwrap_or(true),
        }
    }

    /// `Initialize`'s process-name gate: `EXCLUDE_PROCESSES` wins over
    /// `INCLUDE_PROCESSES` when both name the same process, matching
    /// the deny-list-first reading of spec §6.
    pub fn process_is_excluded(&self, process_name: &str) -> bool {
        if self.exclude_processes.contains(process_name) {
            return true;
        }
        !self.include_processes.is_empty() && !self.include_processes.contains(process_name)
    }

    pub fn integration_is_disabled(&self, integration_name: &str) -> bool {
        self.disabled_integrations.contains(integration_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_enabled_defaults_to_false() {
        let config = EngineConfig::load(&FixedEnv::new());
        assert!(!config.trace_enabled);
    }

    #[test]
    fn exclude_processes_wins_over_include() {
        let env = FixedEnv::new()
            .set("INCLUDE_PROCESSES", "w3wp.exe;dotnet.exe")
            .set("EXCLUDE_PROCESSES", "dotnet.exe");
        let config = EngineConfig::load(&env);
        assert!(config.process_is_excluded("dotnet.exe"));
        assert!(!config.process_is_excluded("w3wp.exe"));
    }

    #[test]
    fn include_list_present_excludes_unlisted_processes() {
        let env = FixedEnv::new().set("INCLUDE_PROCESSES", "w3wp.exe");
        let config = EngineConfig::load(&env);
        assert!(config.process_is_excluded("other.exe"));
    }

    #[test]
    fn empty_include_list_excludes_nothing() {
        let config = EngineConfig::load(&FixedEnv::new());
        assert!(!config.process_is_excluded("anything.exe"));
    }

    #[test]
    fn env_knob_name_matches_the_spec_wire_names() {
        assert_eq!(env_knob_name(EnvKnob::TraceEnabled), "TRACE_ENABLED");
        assert_eq!(env_knob_name(EnvKnob::NativeProfilerPathOverride), "INTERNAL_TRACE_PROFILER_PATH");
        assert_eq!(env_knob_name(EnvKnob::AzureAppServicesAppPoolId), "AZURE_APP_SERVICES_APP_POOL_ID");
    }

    #[test]
    fn disabled_integrations_parses_semicolon_list() {
        let env = FixedEnv::new().set("DISABLED_INTEGRATIONS", "Foo;Bar");
        let config = EngineConfig::load(&env);
        assert!(config.integration_is_disabled("Foo"));
        assert!(!config.integration_is_disabled("Baz"));
    }
}
