//! Type system for the Prism IR.
//!
//! Types are interned in the module's [`UniqueArena`], so two structurally
//! identical types always share one [`Handle`]. Derived types (pointers to a
//! new store type, atomic twins of structs) are never mutated in place: a new
//! [`Type`] is built and inserted instead.

use serde::{Deserialize, Serialize};

use crate::Module;
use crate::arena::{Handle, UniqueArena};
use crate::binding::{AddressSpace, StorageAccess};

/// Width of a scalar type in bytes.
pub type Bytes = u8;

/// The kind of a scalar type.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum ScalarKind {
    /// Boolean.
    Bool,
    /// Signed integer.
    Sint,
    /// Unsigned integer.
    Uint,
    /// Floating point.
    Float,
}

/// A scalar type: kind + byte width.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Scalar {
    pub kind: ScalarKind,
    pub width: Bytes,
}

impl Scalar {
    pub const BOOL: Self = Self {
        kind: ScalarKind::Bool,
        width: 1,
    };
    pub const I32: Self = Self {
        kind: ScalarKind::Sint,
        width: 4,
    };
    pub const U32: Self = Self {
        kind: ScalarKind::Uint,
        width: 4,
    };
    pub const F16: Self = Self {
        kind: ScalarKind::Float,
        width: 2,
    };
    pub const F32: Self = Self {
        kind: ScalarKind::Float,
        width: 4,
    };

    /// Returns `true` for 32-bit integers, the only scalars every target can
    /// operate on atomically.
    pub fn is_integer32(self) -> bool {
        self == Self::I32 || self == Self::U32
    }
}

/// Number of components in a vector.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum VectorSize {
    /// 2 components.
    Bi = 2,
    /// 3 components.
    Tri = 3,
    /// 4 components.
    Quad = 4,
}

impl VectorSize {
    /// Returns the vector size with `n` components, if valid.
    pub fn from_count(n: u32) -> Option<Self> {
        match n {
            2 => Some(Self::Bi),
            3 => Some(Self::Tri),
            4 => Some(Self::Quad),
            _ => None,
        }
    }
}

/// Size of an array.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum ArraySize {
    /// Fixed-size array.
    Constant(u32),
    /// Runtime-sized array.
    Dynamic,
}

/// A member of a struct type.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct StructMember {
    pub name: Option<String>,
    pub ty: Handle<Type>,
    pub offset: u32,
}

/// Dimensionality of a texture.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum TextureDimension {
    D1,
    D2,
    D3,
    Cube,
}

impl TextureDimension {
    /// Number of coordinate components needed to address a texel.
    pub fn coordinate_count(self) -> u32 {
        match self {
            Self::D1 => 1,
            Self::D2 => 2,
            Self::D3 | Self::Cube => 3,
        }
    }
}

/// Texel format of a storage texture.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum TexelFormat {
    Rgba8Unorm,
    Rgba8Snorm,
    Rgba8Uint,
    Rgba8Sint,
    Bgra8Unorm,
    Rgba16Float,
    R32Uint,
    R32Sint,
    R32Float,
    Rg32Float,
    Rgba32Float,
}

/// What kind of data a texture holds.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum TextureClass {
    /// A sampled texture of the given channel kind.
    Sampled { kind: ScalarKind, multi: bool },
    /// A depth texture.
    Depth { multi: bool },
    /// A storage texture.
    Storage {
        format: TexelFormat,
        access: StorageAccess,
    },
    /// An opaque multi-planar video texture.
    External,
}

/// A named type.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Type {
    pub name: Option<String>,
    pub inner: TypeInner,
}

/// The concrete shape of a type.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum TypeInner {
    /// A single scalar value.
    Scalar(Scalar),
    /// A vector of scalars.
    Vector { size: VectorSize, scalar: Scalar },
    /// A matrix of column vectors.
    Matrix {
        columns: VectorSize,
        rows: VectorSize,
        scalar: Scalar,
    },
    /// An atomic scalar.
    Atomic(Scalar),
    /// A pointer to a value in a given address space.
    Pointer {
        base: Handle<Type>,
        space: AddressSpace,
        access: StorageAccess,
    },
    /// A fixed-size or runtime-sized array.
    Array {
        base: Handle<Type>,
        size: ArraySize,
        stride: u32,
    },
    /// A composite struct type.
    Struct {
        members: Vec<StructMember>,
        span: u32,
    },
    /// A texture handle.
    Texture {
        dim: TextureDimension,
        arrayed: bool,
        class: TextureClass,
    },
    /// A sampler handle.
    Sampler { comparison: bool },
}

impl TypeInner {
    /// Returns the scalar of a scalar, vector, matrix or atomic type.
    pub fn scalar(&self) -> Option<Scalar> {
        match *self {
            Self::Scalar(scalar)
            | Self::Vector { scalar, .. }
            | Self::Matrix { scalar, .. }
            | Self::Atomic(scalar) => Some(scalar),
            _ => None,
        }
    }

    /// Returns `true` for opaque handle types (textures and samplers).
    pub fn is_handle(&self) -> bool {
        matches!(self, Self::Texture { .. } | Self::Sampler { .. })
    }

    /// Returns the number of elements addressable by a dynamic index, if the
    /// count is known statically.
    pub fn indexable_length(&self) -> Option<u32> {
        match *self {
            Self::Vector { size, .. } => Some(size as u32),
            Self::Matrix { columns, .. } => Some(columns as u32),
            Self::Array {
                size: ArraySize::Constant(n),
                ..
            } => Some(n),
            _ => None,
        }
    }
}

/// Returns `true` if `ty` is, or transitively contains, an atomic type.
pub fn contains_atomic(types: &UniqueArena<Type>, ty: Handle<Type>) -> bool {
    match types[ty].inner {
        TypeInner::Atomic(_) => true,
        TypeInner::Array { base, .. } => contains_atomic(types, base),
        TypeInner::Struct { ref members, .. } => {
            members.iter().any(|m| contains_atomic(types, m.ty))
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Interning helpers
// ---------------------------------------------------------------------------

impl Module {
    /// Interns an unnamed type.
    pub fn ty(&mut self, inner: TypeInner) -> Handle<Type> {
        self.types.insert(Type { name: None, inner })
    }

    pub fn scalar_ty(&mut self, scalar: Scalar) -> Handle<Type> {
        self.ty(TypeInner::Scalar(scalar))
    }

    pub fn bool_ty(&mut self) -> Handle<Type> {
        self.scalar_ty(Scalar::BOOL)
    }

    pub fn i32_ty(&mut self) -> Handle<Type> {
        self.scalar_ty(Scalar::I32)
    }

    pub fn u32_ty(&mut self) -> Handle<Type> {
        self.scalar_ty(Scalar::U32)
    }

    pub fn f32_ty(&mut self) -> Handle<Type> {
        self.scalar_ty(Scalar::F32)
    }

    pub fn vec_ty(&mut self, size: VectorSize, scalar: Scalar) -> Handle<Type> {
        self.ty(TypeInner::Vector { size, scalar })
    }

    pub fn mat_ty(&mut self, columns: VectorSize, rows: VectorSize, scalar: Scalar) -> Handle<Type> {
        self.ty(TypeInner::Matrix {
            columns,
            rows,
            scalar,
        })
    }

    pub fn atomic_ty(&mut self, scalar: Scalar) -> Handle<Type> {
        self.ty(TypeInner::Atomic(scalar))
    }

    pub fn array_ty(&mut self, base: Handle<Type>, size: ArraySize, stride: u32) -> Handle<Type> {
        self.ty(TypeInner::Array { base, size, stride })
    }

    pub fn pointer_ty(
        &mut self,
        space: AddressSpace,
        base: Handle<Type>,
        access: StorageAccess,
    ) -> Handle<Type> {
        self.ty(TypeInner::Pointer {
            base,
            space,
            access,
        })
    }

    /// Interns a named struct type.
    pub fn struct_ty(
        &mut self,
        name: impl Into<String>,
        members: Vec<StructMember>,
        span: u32,
    ) -> Handle<Type> {
        self.types.insert(Type {
            name: Some(name.into()),
            inner: TypeInner::Struct { members, span },
        })
    }

    /// `texture_2d<f32>`, the type of each external-texture plane.
    pub fn texture_2d_f32_ty(&mut self) -> Handle<Type> {
        self.ty(TypeInner::Texture {
            dim: TextureDimension::D2,
            arrayed: false,
            class: TextureClass::Sampled {
                kind: ScalarKind::Float,
                multi: false,
            },
        })
    }

    pub fn external_texture_ty(&mut self) -> Handle<Type> {
        self.ty(TypeInner::Texture {
            dim: TextureDimension::D2,
            arrayed: false,
            class: TextureClass::External,
        })
    }

    pub fn sampler_ty(&mut self, comparison: bool) -> Handle<Type> {
        self.ty(TypeInner::Sampler { comparison })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Returns the pointee of a pointer type, or `None` for non-pointers.
    pub fn pointee(&self, ty: Handle<Type>) -> Option<Handle<Type>> {
        match self.types[ty].inner {
            TypeInner::Pointer { base, .. } => Some(base),
            _ => None,
        }
    }

    /// Returns `(space, pointee, access)` of a pointer type.
    pub fn pointer_parts(
        &self,
        ty: Handle<Type>,
    ) -> Option<(AddressSpace, Handle<Type>, StorageAccess)> {
        match self.types[ty].inner {
            TypeInner::Pointer {
                base,
                space,
                access,
            } => Some((space, base, access)),
            _ => None,
        }
    }

    /// Returns `true` if `ty` is, or transitively contains, an atomic type.
    pub fn contains_atomic(&self, ty: Handle<Type>) -> bool {
        contains_atomic(&self.types, ty)
    }

    /// Returns the type of element `index` of the composite `ty`.
    ///
    /// `index` is only consulted for structs, where it must be a constant.
    pub fn element_type(&mut self, ty: Handle<Type>, index: Option<u32>) -> Option<Handle<Type>> {
        match self.types[ty].inner {
            TypeInner::Vector { scalar, .. } => Some(self.scalar_ty(scalar)),
            TypeInner::Matrix { rows, scalar, .. } => Some(self.vec_ty(rows, scalar)),
            TypeInner::Array { base, .. } => Some(base),
            TypeInner::Struct { ref members, .. } => {
                let index = index? as usize;
                members.get(index).map(|m| m.ty)
            }
            _ => None,
        }
    }

    /// Result type of indexing `object_ty` with `indices`. Indexing through a
    /// pointer yields a pointer with the same address space and access.
    pub fn access_result_type(
        &mut self,
        object_ty: Handle<Type>,
        indices: &[Handle<crate::Value>],
    ) -> Option<Handle<Type>> {
        let (pointer, mut current) = match self.pointer_parts(object_ty) {
            Some((space, base, access)) => (Some((space, access)), base),
            None => (None, object_ty),
        };
        for &index in indices {
            let constant = self.const_index(index);
            current = self.element_type(current, constant)?;
        }
        Some(match pointer {
            Some((space, access)) => self.pointer_ty(space, current, access),
            None => current,
        })
    }

    /// Result type of `left op right` under the usual shader typing rules.
    pub fn binary_result_type(
        &mut self,
        op: crate::BinaryOp,
        left: Handle<Type>,
        right: Handle<Type>,
    ) -> Handle<Type> {
        let l = self.types[left].inner.clone();
        let r = self.types[right].inner.clone();
        if op.is_comparison() {
            return match l {
                TypeInner::Vector { size, .. } => self.vec_ty(size, Scalar::BOOL),
                _ => self.bool_ty(),
            };
        }
        match (op, l, r) {
            (
                crate::BinaryOp::Multiply,
                TypeInner::Matrix { rows, scalar, .. },
                TypeInner::Vector { .. },
            ) => self.vec_ty(rows, scalar),
            (
                crate::BinaryOp::Multiply,
                TypeInner::Vector { .. },
                TypeInner::Matrix {
                    columns, scalar, ..
                },
            ) => self.vec_ty(columns, scalar),
            (
                crate::BinaryOp::Multiply,
                TypeInner::Matrix { rows, scalar, .. },
                TypeInner::Matrix { columns, .. },
            ) => self.mat_ty(columns, rows, scalar),
            (_, TypeInner::Scalar(_), TypeInner::Vector { .. } | TypeInner::Matrix { .. }) => {
                right
            }
            _ => left,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_constants() {
        assert_eq!(Scalar::F32.kind, ScalarKind::Float);
        assert_eq!(Scalar::F32.width, 4);
        assert_eq!(Scalar::U32.kind, ScalarKind::Uint);
        assert_eq!(Scalar::BOOL.width, 1);
        assert!(Scalar::I32.is_integer32());
        assert!(!Scalar::F32.is_integer32());
    }

    #[test]
    fn type_dedup() {
        let mut types = UniqueArena::new();
        let t0 = types.insert(Type {
            name: None,
            inner: TypeInner::Scalar(Scalar::F32),
        });
        let t1 = types.insert(Type {
            name: None,
            inner: TypeInner::Scalar(Scalar::F32),
        });
        assert_eq!(t0, t1);
        assert_eq!(types.len(), 1);
    }

    #[test]
    fn same_shape_different_name_is_distinct() {
        let mut module = Module::new();
        let u32_ty = module.u32_ty();
        let members = vec![StructMember {
            name: Some("a".into()),
            ty: u32_ty,
            offset: 0,
        }];
        let s = module.struct_ty("S", members.clone(), 4);
        let t = module.struct_ty("T", members.clone(), 4);
        assert_ne!(s, t);
        assert_eq!(module.struct_ty("S", members, 4), s);
    }

    #[test]
    fn contains_atomic_nested() {
        let mut module = Module::new();
        let atomic = module.atomic_ty(Scalar::U32);
        let u32_ty = module.u32_ty();
        let inner = module.struct_ty(
            "Inner",
            vec![StructMember {
                name: Some("a".into()),
                ty: atomic,
                offset: 0,
            }],
            4,
        );
        let arr = module.array_ty(inner, ArraySize::Constant(4), 4);
        assert!(module.contains_atomic(arr));
        assert!(!module.contains_atomic(u32_ty));
    }

    #[test]
    fn element_types() {
        let mut module = Module::new();
        let m = module.mat_ty(VectorSize::Tri, VectorSize::Quad, Scalar::F32);
        let column = module.element_type(m, None).unwrap();
        assert_eq!(
            module.types[column].inner,
            TypeInner::Vector {
                size: VectorSize::Quad,
                scalar: Scalar::F32
            }
        );
        assert_eq!(module.types[m].inner.indexable_length(), Some(3));
    }
}
