//! Built-in method descriptor for in-process native functions
//!
//! The simplest thing a hooking target can be: a function that is already
//! machine code at a fixed address. Identity is the address, the entry
//! pointer is the address, and requesting compilation is a no-op. Managed
//! runtimes supply their own [`MethodDescriptor`] implementation instead.

use latch_common::{Error, MethodDescriptor, MethodId, MethodSig, Result};

#[derive(Debug)]
pub struct NativeFunction {
    name: String,
    address: usize,
    sig: MethodSig,
}

impl NativeFunction {
    pub fn new(name: impl Into<String>, address: usize, sig: MethodSig) -> Result<Self> {
        if address == 0 {
            return Err(Error::InvalidTarget("null function address".into()));
        }
        Ok(Self {
            name: name.into(),
            address,
            sig,
        })
    }
}

impl MethodDescriptor for NativeFunction {
    fn id(&self) -> MethodId {
        MethodId(self.address as u64)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> &MethodSig {
        &self.sig
    }

    fn entry_pointer(&self) -> usize {
        self.address
    }

    fn request_compilation(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_address() {
        let f = NativeFunction::new(
            "f",
            0x1234,
            MethodSig::function(&["i64"], None),
        )
        .unwrap();
        assert_eq!(f.id(), MethodId(0x1234));
        assert_eq!(f.entry_pointer(), 0x1234);
        assert_eq!(f.name(), "f");
    }

    #[test]
    fn test_null_address_rejected() {
        let err = NativeFunction::new("f", 0, MethodSig::function(&[], None)).unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
    }
}
