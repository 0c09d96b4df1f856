//! Method identity, signature and descriptor types
//!
//! The engine never touches runtime reflection itself; whoever embeds it
//! supplies a [`MethodDescriptor`] exposing identity, a signature, the
//! current entry pointer and a way to request compilation. Signatures use
//! plain type names so the verification step can compare shapes without
//! knowing anything about the runtime's type system.

use serde::{Deserialize, Serialize};

/// Process-wide method identity, key of the registration and resolution caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodId(pub u64);

/// One parameter of a method or hook signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSig {
    pub type_name: String,
    pub by_ref: bool,
}

impl ParamSig {
    pub fn value(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            by_ref: false,
        }
    }

    pub fn by_ref(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            by_ref: true,
        }
    }
}

/// Shape of a method as far as hooking is concerned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodSig {
    pub is_static: bool,
    /// Declaring type name for instance methods
    pub declaring_type: Option<String>,
    pub params: Vec<ParamSig>,
    /// `None` for void methods
    pub return_type: Option<String>,
}

impl MethodSig {
    /// Signature of a free/static function.
    pub fn function(params: &[&str], return_type: Option<&str>) -> Self {
        Self {
            is_static: true,
            declaring_type: None,
            params: params.iter().map(|p| ParamSig::value(*p)).collect(),
            return_type: return_type.map(str::to_string),
        }
    }

    /// Signature of an instance method on `declaring_type`.
    pub fn instance(declaring_type: &str, params: &[&str], return_type: Option<&str>) -> Self {
        Self {
            is_static: false,
            declaring_type: Some(declaring_type.to_string()),
            params: params.iter().map(|p| ParamSig::value(*p)).collect(),
            return_type: return_type.map(str::to_string),
        }
    }

    /// Signature of a well-formed hook: static, bool return, all by-ref.
    pub fn hook(params: &[&str]) -> Self {
        Self {
            is_static: true,
            declaring_type: None,
            params: params.iter().map(|p| ParamSig::by_ref(*p)).collect(),
            return_type: Some("bool".to_string()),
        }
    }

    pub fn has_return(&self) -> bool {
        self.return_type.is_some()
    }

    /// Number of machine arguments the compiled method receives, including
    /// the implicit `this` for instance methods.
    pub fn machine_arg_count(&self) -> usize {
        self.params.len() + usize::from(!self.is_static)
    }

    /// Type names a hook for this method must take, in order: declaring type
    /// for instance methods, then every parameter, then the return type.
    pub fn hook_parameter_types(&self) -> Vec<String> {
        let mut types = Vec::with_capacity(self.machine_arg_count() + 1);
        if !self.is_static {
            types.push(
                self.declaring_type
                    .clone()
                    .unwrap_or_else(|| "object".to_string()),
            );
        }
        types.extend(self.params.iter().map(|p| p.type_name.clone()));
        if let Some(ret) = &self.return_type {
            types.push(ret.clone());
        }
        types
    }

    /// Human-readable expected hook shape, used in signature-mismatch errors.
    pub fn expected_hook_signature(&self) -> String {
        let params = self
            .hook_parameter_types()
            .iter()
            .map(|t| format!("ref {}", t))
            .collect::<Vec<_>>()
            .join(", ");
        format!("bool hook({})", params)
    }
}

/// A candidate hook function: its address plus its own signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDescriptor {
    pub name: String,
    pub address: usize,
    pub sig: MethodSig,
}

impl HookDescriptor {
    pub fn new(name: impl Into<String>, address: usize, sig: MethodSig) -> Self {
        Self {
            name: name.into(),
            address,
            sig,
        }
    }
}

/// The managed-method abstraction the engine consumes.
///
/// `entry_pointer` returns wherever the runtime currently points for this
/// method; that may be a precode/thunk rather than final native code, which
/// is exactly what the resolver untangles. `request_compilation` asks the
/// runtime to schedule JIT compilation and may be a no-op for code that is
/// already native.
pub trait MethodDescriptor: Send + Sync {
    fn id(&self) -> MethodId;
    fn name(&self) -> &str;
    fn signature(&self) -> &MethodSig;
    fn entry_pointer(&self) -> usize;
    fn request_compilation(&self);
}
