//! Binding points, address spaces, access modes and shader IO bindings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A `(group, binding)` pair identifying a resource slot.
///
/// Ordered group-major, binding-minor.
#[derive(
    Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct BindingPoint {
    pub group: u32,
    pub binding: u32,
}

impl BindingPoint {
    pub const fn new(group: u32, binding: u32) -> Self {
        Self { group, binding }
    }
}

impl fmt::Display for BindingPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@group({}) @binding({})", self.group, self.binding)
    }
}

/// Bitflags for memory access modes.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct StorageAccess(u32);

impl StorageAccess {
    /// No access.
    pub const EMPTY: Self = Self(0);
    /// Read access.
    pub const LOAD: Self = Self(1);
    /// Write access.
    pub const STORE: Self = Self(2);
    /// Read and write access.
    pub const LOAD_STORE: Self = Self(3);

    /// Returns `true` if `self` contains all flags in `other`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no flags are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for StorageAccess {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for StorageAccess {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Memory address space for variables and pointers.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum AddressSpace {
    /// Function-local storage.
    Function,
    /// Module-scope private storage.
    Private,
    /// Workgroup shared storage.
    Workgroup,
    /// Uniform buffer (read-only).
    Uniform,
    /// Storage buffer.
    Storage,
    /// Push-constant style immediate data.
    Immediate,
    /// Opaque handles: textures and samplers.
    Handle,
}

impl AddressSpace {
    /// Returns `true` if variables in this space are bound resources.
    pub fn is_resource(self) -> bool {
        matches!(self, Self::Uniform | Self::Storage | Self::Handle)
    }
}

/// Built-in shader inputs/outputs.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum BuiltIn {
    Position,
    FragDepth,
    FrontFacing,
    VertexIndex,
    InstanceIndex,
    SampleIndex,
    /// `@builtin(global_invocation_id)`: vec3<u32>
    GlobalInvocationId,
    /// `@builtin(local_invocation_id)`: vec3<u32>
    LocalInvocationId,
    /// `@builtin(local_invocation_index)`: u32
    LocalInvocationIndex,
    /// `@builtin(workgroup_id)`: vec3<u32>
    WorkgroupId,
    /// `@builtin(num_workgroups)`: vec3<u32>
    NumWorkgroups,
}

/// A binding for an entry-point parameter or result.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Binding {
    /// A built-in shader variable.
    BuiltIn(BuiltIn),
    /// A user-defined location.
    Location { location: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_access_flags() {
        let read = StorageAccess::LOAD;
        let write = StorageAccess::STORE;
        let rw = read | write;
        assert_eq!(rw, StorageAccess::LOAD_STORE);
        assert!(rw.contains(read));
        assert!(rw.contains(write));
        assert!(!read.contains(write));
        assert!(!StorageAccess::EMPTY.contains(read));
        assert!(StorageAccess::EMPTY.is_empty());
    }

    #[test]
    fn binding_point_total_order() {
        let points = [
            BindingPoint::new(0, 0),
            BindingPoint::new(0, 7),
            BindingPoint::new(1, 0),
            BindingPoint::new(1, 3),
            BindingPoint::new(2, 1),
        ];
        for (i, a) in points.iter().enumerate() {
            for (j, b) in points.iter().enumerate() {
                let relations = [a < b, a == b, b < a];
                assert_eq!(relations.iter().filter(|&&r| r).count(), 1);
                assert_eq!(a.cmp(b), i.cmp(&j));
                assert_eq!(a.cmp(b), (a.group, a.binding).cmp(&(b.group, b.binding)));
            }
        }
    }

    #[test]
    fn binding_point_display() {
        assert_eq!(
            BindingPoint::new(1, 2).to_string(),
            "@group(1) @binding(2)"
        );
    }

    #[test]
    fn resource_spaces() {
        assert!(AddressSpace::Handle.is_resource());
        assert!(AddressSpace::Storage.is_resource());
        assert!(!AddressSpace::Workgroup.is_resource());
    }
}
