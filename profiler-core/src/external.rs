//! External interfaces (spec §4.9, §6): the shapes the core receives
//! from collaborators it never implements — the native payload bridge,
//! rule ingestion, and the runtime-embedded payload bytes. Grounded on
//! `bsharp_analysis::context`'s split between a plain data struct
//! (`RuleRecord`) and the trait that supplies it (`RuleSource`), the
//! same shape the teacher uses for `AnalysisConfig`/its loader.

use profiler_il::rule::{AssemblyIdentity, Target, VersionTriple, VersionWindow, Wrapper, WrapperAction};
use profiler_il::MethodReplacement;

/// The four quantities `GetAssemblyAndSymbolsBytes` returns: pointers
/// and lengths of the embedded managed assembly and its debug symbols.
/// Memory is owned by the host binary and lives at least until process
/// exit — the core never frees it.
pub trait PayloadBridge: Send + Sync {
    fn managed_assembly_bytes(&self) -> (*const u8, usize);
    fn managed_symbols_bytes(&self) -> (*const u8, usize);
}

/// One flat rule record as `InitializeProfiler` receives it — every
/// string nullable, every version component a `u16` with `0` meaning
/// unbounded (spec §6).
#[derive(Debug, Clone)]
pub struct RuleRecord {
    pub integration_name: Option<String>,
    pub target_assembly: Option<String>,
    pub target_type: Option<String>,
    pub target_method: Option<String>,
    pub target_minimum_major: u16,
    pub target_minimum_minor: u16,
    pub target_minimum_patch: u16,
    pub target_maximum_major: u16,
    pub target_maximum_minor: u16,
    pub target_maximum_patch: u16,
    pub signature_types: Vec<Option<String>>,
    pub wrapper_assembly: Option<String>,
    pub wrapper_type: Option<String>,
    pub wrapper_method: Option<String>,
    pub wrapper_action: WrapperAction,
    pub wrapper_signature: Vec<u8>,
}

/// A single record's conversion failure — missing a field with no
/// sensible default. The caller (`RuleSource::initialize_profiler`)
/// drops the record and logs a non-fatal skip rather than rejecting
/// the whole batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRecordError {
    pub field: &'static str,
}

/// Converts one wire record into the engine's internal rule shape.
/// Pure: no host calls, no logging — the caller decides what to do
/// with an `Err`.
pub fn parse_rule_record(record: &RuleRecord) -> Result<MethodReplacement, RuleRecordError> {
    let target_assembly = record.target_assembly.clone().ok_or(RuleRecordError { field: "targetAssembly" })?;
    let target_type = record.target_type.clone().ok_or(RuleRecordError { field: "targetType" })?;
    let target_method = record.target_method.clone().ok_or(RuleRecordError { field: "targetMethod" })?;
    let wrapper_assembly = record.wrapper_assembly.clone().ok_or(RuleRecordError { field: "wrapperAssembly" })?;
    let wrapper_type = record.wrapper_type.clone().ok_or(RuleRecordError { field: "wrapperType" })?;

    let signature_types = record
        .signature_types
        .iter()
        .map(|s| s.clone().unwrap_or_else(|| "_".to_string()))
        .collect();

    Ok(MethodReplacement {
        integration_name: record.integration_name.clone().unwrap_or_else(|| format!("{target_type}.{target_method}")),
        target: Target {
            assembly_name: target_assembly,
            type_name: target_type,
            method_name: target_method,
            version_window: VersionWindow {
                minimum: VersionTriple { major: record.target_minimum_major, minor: record.target_minimum_minor, patch: record.target_minimum_patch },
                maximum: VersionTriple { major: record.target_maximum_major, minor: record.target_maximum_minor, patch: record.target_maximum_patch },
            },
            signature_types,
        },
        wrapper: Wrapper {
            assembly: AssemblyIdentity { name: wrapper_assembly, version: VersionTriple::UNBOUNDED, locale: None, public_key_token: None },
            type_name: wrapper_type,
            method_name: record.wrapper_method.clone().unwrap_or_default(),
            action: record.wrapper_action,
            signature: record.wrapper_signature.clone(),
        },
    })
}

/// `InitializeProfiler(id, items, count)`: idempotent by `id` — a
/// second call with an already-seen id is a no-op, per spec §4.9.
/// Implemented by the binary crate's FFI boundary; this trait exists so
/// `ProfilerController::ingest_rules` has a stable seam to be driven
/// through independent of how the host marshals the wide-char arrays.
pub trait RuleSource {
    fn initialize_profiler(&self, id: &str, items: &[RuleRecord]) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RuleRecord {
        RuleRecord {
            integration_name: Some("Sample".into()),
            target_assembly: Some("Target.Assembly".into()),
            target_type: Some("Target.Type".into()),
            target_method: Some("Foo".into()),
            target_minimum_major: 0,
            target_minimum_minor: 0,
            target_minimum_patch: 0,
            target_maximum_major: 0,
            target_maximum_minor: 0,
            target_maximum_patch: 0,
            signature_types: vec![None, Some("System.String".into())],
            wrapper_assembly: Some("Wrapper.Assembly".into()),
            wrapper_type: Some("Wrapper.Type".into()),
            wrapper_method: Some("Foo".into()),
            wrapper_action: WrapperAction::ReplaceTargetMethod,
            wrapper_signature: vec![0x00, 0x06],
        }
    }

    #[test]
    fn missing_target_assembly_is_rejected() {
        let mut record = sample();
        record.target_assembly = None;
        assert_eq!(parse_rule_record(&record), Err(RuleRecordError { field: "targetAssembly" }));
    }

    #[test]
    fn null_signature_type_becomes_wildcard() {
        let record = sample();
        let rule = parse_rule_record(&record).unwrap();
        assert_eq!(rule.target.signature_types[0], "_");
        assert_eq!(rule.target.signature_types[1], "System.String");
    }

    #[test]
    fn unbounded_version_window_contains_everything() {
        let record = sample();
        let rule = parse_rule_record(&record).unwrap();
        assert!(rule.target.version_window.contains(VersionTriple { major: 42, minor: 0, patch: 0 }));
    }
}
