//! Hook registrations
//!
//! A [`MethodHook`] is the public handle for one hooked method: resolved
//! native state, generated stub, indirect cell, hook chain and the enabled
//! flag. One registration exists per method identity per environment;
//! [`MethodHook::create`] returns the existing one when asked again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use latch_common::{Error, HookDescriptor, MethodDescriptor, Result};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::chain::HookChain;
use crate::env::HookingEnv;
use crate::indirects::IndirectCell;
use crate::stub::{self, Prologue, StubCode};

struct HookState {
    stub: StubCode,
    cell: IndirectCell,
    chain: HookChain,
    hooks: Vec<HookDescriptor>,
}

pub struct MethodHook {
    env: Weak<HookingEnv>,
    method: Arc<dyn MethodDescriptor>,
    native_code: usize,
    /// Original entry instructions, captured before the patch; rebuilds
    /// must not re-read the (patched) live bytes.
    prologue: Prologue,
    state: Mutex<HookState>,
    enabled: AtomicBool,
}

impl MethodHook {
    /// Creates (or returns the existing) registration for `method`.
    ///
    /// Resolution of the method's native state is a precondition and may
    /// block; cache lookup and construction run under the environment's
    /// registration lock so concurrent calls never build two registrations
    /// for the same identity.
    pub(crate) fn create(
        env: &Arc<HookingEnv>,
        method: Arc<dyn MethodDescriptor>,
    ) -> Result<Arc<MethodHook>> {
        let native = env.resolver().resolve(Arc::clone(&method))?;
        let native_code = native
            .native_code()
            .ok_or_else(|| Error::Internal("resolver returned unresolved state".into()))?;

        let mut registrations = env.registrations().lock();
        if let Some(existing) = registrations.get(&method.id()) {
            return Ok(Arc::clone(existing));
        }

        let prologue = Prologue::capture(native_code)?;
        let (stub, cell, chain) = {
            let mut allocator = env.allocator().lock();
            let cell = allocator.create_indirect(native_code)?;
            let chain = allocator.create_chain()?;
            let stub = stub::build_stub(&mut allocator, &prologue, method.signature(), &chain)?;
            (stub, cell, chain)
        };

        // Disabled until asked otherwise: the cell routes through the
        // call-original block, then the entry patch goes live.
        cell.store(stub.call_original);
        stub::patch_entry(native_code, stub.prologue_len, cell.address())?;

        info!(
            target: "latch_core::registry",
            method = method.name(),
            native = format_args!("{native_code:#x}"),
            routine = format_args!("{:#x}", stub.routine.address),
            "installed hook plumbing"
        );

        let hook = Arc::new(MethodHook {
            env: Arc::downgrade(env),
            method: Arc::clone(&method),
            native_code,
            prologue,
            state: Mutex::new(HookState {
                stub,
                cell,
                chain,
                hooks: Vec::new(),
            }),
            enabled: AtomicBool::new(false),
        });
        registrations.insert(method.id(), Arc::clone(&hook));
        Ok(hook)
    }

    pub fn method(&self) -> &Arc<dyn MethodDescriptor> {
        &self.method
    }

    pub fn native_code(&self) -> usize {
        self.native_code
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn hook_count(&self) -> usize {
        self.state.lock().hooks.len()
    }

    /// Appends `hook` and rebuilds the stub.
    ///
    /// Redirection is suspended for the rebuild, so calls racing this
    /// operation run the original unhooked; a call already inside the old
    /// stub may still walk chain nodes while they are recycled. That window
    /// is a documented limitation, not a guarantee.
    pub fn add_hook(&self, hook: &HookDescriptor) -> Result<()> {
        self.verify_signature(hook)?;
        let env = self.env()?;

        let mut state = self.state.lock();
        let was_enabled = self.suspend(&state);

        {
            let mut allocator = env.allocator().lock();
            allocator.chain_append(&mut state.chain, hook.address)?;
        }
        state.hooks.push(hook.clone());
        self.rebuild(&env, &mut state)?;

        if was_enabled {
            self.activate(&state);
        }
        debug!(
            target: "latch_core::registry",
            method = self.method.name(),
            hook = hook.name.as_str(),
            count = state.hooks.len(),
            "hook added"
        );
        Ok(())
    }

    /// Removes `hook` if present; unknown hooks are a no-op.
    pub fn remove_hook(&self, hook: &HookDescriptor) -> Result<()> {
        let env = self.env()?;

        let mut state = self.state.lock();
        let Some(index) = state.hooks.iter().position(|h| h.address == hook.address) else {
            return Ok(());
        };

        let was_enabled = self.suspend(&state);

        {
            let mut allocator = env.allocator().lock();
            allocator.chain_remove(&mut state.chain, hook.address);
        }
        state.hooks.remove(index);
        self.rebuild(&env, &mut state)?;

        if was_enabled {
            self.activate(&state);
        }
        debug!(
            target: "latch_core::registry",
            method = self.method.name(),
            hook = hook.name.as_str(),
            count = state.hooks.len(),
            "hook removed"
        );
        Ok(())
    }

    /// Points the indirect cell at the stub entry. Idempotent.
    pub fn enable(&self) {
        if self.enabled.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = self.state.lock();
        self.activate(&state);
    }

    /// Points the indirect cell back at the call-original block. Idempotent.
    pub fn disable(&self) {
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return;
        }
        let state = self.state.lock();
        state.cell.store(state.stub.call_original);
    }

    /// Registered hooks in call order.
    pub fn hooks(&self) -> Vec<HookDescriptor> {
        self.state.lock().hooks.clone()
    }

    fn env(&self) -> Result<Arc<HookingEnv>> {
        self.env
            .upgrade()
            .ok_or_else(|| Error::Internal("hooking environment was dropped".into()))
    }

    /// Suspends redirection for a rebuild, returning the prior state.
    fn suspend(&self, state: &HookState) -> bool {
        let was_enabled = self.is_enabled();
        if was_enabled {
            state.cell.store(state.stub.call_original);
        }
        was_enabled
    }

    fn activate(&self, state: &HookState) {
        state.cell.store(state.stub.entry);
    }

    /// Regenerates the routine from scratch for the current chain and swaps
    /// it in; the old routine is zeroed and its placement released.
    fn rebuild(&self, env: &Arc<HookingEnv>, state: &mut HookState) -> Result<()> {
        let mut allocator = env.allocator().lock();
        let new_stub = stub::build_stub(
            &mut allocator,
            &self.prologue,
            self.method.signature(),
            &state.chain,
        )?;

        let old = std::mem::replace(&mut state.stub, new_stub);
        // Route through the new call-original block before the old routine
        // is zeroed; enable() re-targets the entry afterwards if needed.
        state.cell.store(state.stub.call_original);
        allocator.remove_routine(old.routine);
        Ok(())
    }

    fn verify_signature(&self, hook: &HookDescriptor) -> Result<()> {
        verify_signature(self.method.signature(), hook)
    }
}

/// Checks a candidate hook against the strict contract: static, bool
/// return, one by-ref parameter per machine argument of the target plus a
/// trailing by-ref return parameter when the target is non-void.
fn verify_signature(target: &latch_common::MethodSig, hook: &HookDescriptor) -> Result<()> {
    let expected = target.hook_parameter_types();
    let mismatch = |message: String| Error::SignatureMismatch {
        message,
        expected: target.expected_hook_signature(),
    };

    if !hook.sig.is_static {
        return Err(mismatch("method must be static".into()));
    }
    if hook.sig.return_type.as_deref() != Some("bool") {
        return Err(mismatch("return type must be 'bool'".into()));
    }
    if hook.sig.params.len() != expected.len() {
        return Err(mismatch("wrong number of arguments".into()));
    }
    if let Some(param) = hook.sig.params.iter().find(|p| !p.by_ref) {
        return Err(mismatch(format!(
            "argument '{}' must have the ref modifier",
            param.type_name
        )));
    }
    for (index, (param, expected_ty)) in hook.sig.params.iter().zip(&expected).enumerate() {
        if &param.type_name != expected_ty {
            return Err(mismatch(format!(
                "the type of the {}-th argument, {}, is not the expected {}",
                index + 1,
                param.type_name,
                expected_ty
            )));
        }
    }
    Ok(())
}

impl std::fmt::Debug for MethodHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MethodHook")
            .field("method", &self.method.name())
            .field("native_code", &format_args!("{:#x}", self.native_code))
            .field("routine", &format_args!("{:#x}", state.stub.routine.address))
            .field("cell", &format_args!("{:#x}", state.cell.address()))
            .field("hooks", &state.hooks.len())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latch_common::{MethodSig, ParamSig};

    fn target_sig() -> MethodSig {
        MethodSig::function(&["bool", "i64", "string"], Some("string"))
    }

    #[test]
    fn test_verify_accepts_matching_hook() {
        let hook = HookDescriptor::new(
            "h",
            0x3000,
            MethodSig::hook(&["bool", "i64", "string", "string"]),
        );
        assert!(verify_signature(&target_sig(), &hook).is_ok());
    }

    #[test]
    fn test_verify_rejects_instance_hook() {
        let mut sig = MethodSig::hook(&["bool", "i64", "string", "string"]);
        sig.is_static = false;
        let err =
            verify_signature(&target_sig(), &HookDescriptor::new("h", 0x3000, sig)).unwrap_err();
        assert!(format!("{err}").contains("must be static"));
    }

    #[test]
    fn test_verify_rejects_wrong_return() {
        let mut sig = MethodSig::hook(&["bool", "i64", "string", "string"]);
        sig.return_type = Some("i64".into());
        let err =
            verify_signature(&target_sig(), &HookDescriptor::new("h", 0x3000, sig)).unwrap_err();
        assert!(format!("{err}").contains("return type must be 'bool'"));
    }

    #[test]
    fn test_verify_rejects_wrong_arity() {
        let sig = MethodSig::hook(&["bool", "i64"]);
        let err =
            verify_signature(&target_sig(), &HookDescriptor::new("h", 0x3000, sig)).unwrap_err();
        assert!(format!("{err}").contains("wrong number of arguments"));
    }

    #[test]
    fn test_verify_rejects_by_value_param() {
        let mut sig = MethodSig::hook(&["bool", "i64", "string", "string"]);
        sig.params[1] = ParamSig::value("i64");
        let err =
            verify_signature(&target_sig(), &HookDescriptor::new("h", 0x3000, sig)).unwrap_err();
        assert!(format!("{err}").contains("ref modifier"));
    }

    #[test]
    fn test_verify_rejects_type_mismatch() {
        let sig = MethodSig::hook(&["bool", "f64", "string", "string"]);
        let err =
            verify_signature(&target_sig(), &HookDescriptor::new("h", 0x3000, sig)).unwrap_err();
        let text = format!("{err}");
        assert!(text.contains("2-th"));
        assert!(text.contains("Expected signature"));
    }

    #[test]
    fn test_verify_reports_expected_shape_with_instance_target() {
        let target = MethodSig::instance("Widget", &["i64"], Some("i64"));
        let sig = MethodSig::hook(&["i64"]);
        let err = verify_signature(&target, &HookDescriptor::new("h", 0x3000, sig)).unwrap_err();
        assert!(format!("{err}").contains("bool hook(ref Widget, ref i64, ref i64)"));
    }
}
