//! Integration tests for atomic type propagation: shared twin types,
//! nested structs and function versioning.

use prism_ir::*;
use prism_transform::atomics::{self, Config};

fn storage(module: &mut Module, name: &str, ty: Handle<Type>, binding: u32) -> Handle<Value> {
    let root = module.root;
    Builder::at_end(module, root).var(
        name,
        AddressSpace::Storage,
        ty,
        StorageAccess::LOAD_STORE,
        Some(BindingPoint::new(0, binding)),
    )
}

fn member(name: &str, ty: Handle<Type>, offset: u32) -> StructMember {
    StructMember {
        name: Some(name.into()),
        ty,
        offset,
    }
}

fn entry_block(module: &mut Module) -> Handle<Block> {
    let f = module.new_function("main", None, Some(ShaderStage::Compute));
    module.functions[f].workgroup_size = Some([64, 1, 1]);
    module.functions[f].block
}

fn types_named(module: &Module, name: &str) -> usize {
    module
        .types
        .iter()
        .filter(|(_, ty)| ty.name.as_deref() == Some(name))
        .count()
}

#[test]
fn buffers_of_one_struct_share_a_twin() {
    let mut module = Module::new();
    let u32_ty = module.u32_ty();
    let s = module.struct_ty(
        "S",
        vec![member("a", u32_ty, 0), member("b", u32_ty, 4)],
        8,
    );
    let x = storage(&mut module, "x", s, 0);
    let y = storage(&mut module, "y", s, 1);
    let z = storage(&mut module, "z", s, 2);

    let block = entry_block(&mut module);
    let mut b = Builder::at_end(&mut module, block);
    let zero = b.u32(0);
    let one = b.u32(1);
    let xa = b.access_ptr(x, &[zero]);
    let yb = b.access_ptr(y, &[one]);
    b.stub(Some(u32_ty), Stub::Atomic(AtomicStub::IAdd), &[xa, one]);
    b.stub(Some(u32_ty), Stub::Atomic(AtomicStub::UMax), &[yb, one]);
    let copy = b.load(z);
    b.store(z, copy);
    b.return_(None);
    validate(&module, Capabilities::ALLOW_STUBS).unwrap();

    let out = atomics::run(&mut module, &Config::default()).unwrap();
    assert_eq!(out.retyped_roots, 2);
    assert_eq!(out.lowered_stubs, 2);
    validate(&module, Capabilities::EMPTY).unwrap();

    // Members reached through either buffer are atomic in the one twin.
    let dump = dump_module(&module);
    assert!(dump.contains("S_atomic = struct { a: atomic<u32>, b: atomic<u32> }"));
    assert_eq!(types_named(&module, "S_atomic"), 1);
    assert_eq!(module.value_type(x), module.value_type(y));
    assert!(dump.contains("%z: ptr<storage, S, read_write>"));
    assert!(dump.contains("atomicAdd"));
    assert!(dump.contains("atomicMax"));

    // A second run finds nothing left to do.
    let again = atomics::run(&mut module, &Config::default()).unwrap();
    assert_eq!(again, atomics::Output::default());
    assert_eq!(types_named(&module, "S_atomic"), 1);
}

#[test]
fn nested_structs_fork_along_the_path() {
    let mut module = Module::new();
    let u32_ty = module.u32_ty();
    let inner = module.struct_ty(
        "Inner",
        vec![member("x", u32_ty, 0), member("y", u32_ty, 4)],
        8,
    );
    let mid = module.struct_ty(
        "Mid",
        vec![member("inner", inner, 0), member("z", u32_ty, 8)],
        12,
    );
    let outer = module.struct_ty(
        "Outer",
        vec![member("mid", mid, 0), member("w", u32_ty, 12)],
        16,
    );
    let buf = storage(&mut module, "buf", outer, 0);

    let block = entry_block(&mut module);
    let mut b = Builder::at_end(&mut module, block);
    let zero = b.u32(0);
    let one = b.u32(1);
    let leaf = b.access_ptr(buf, &[zero, zero, zero]);
    b.stub(Some(u32_ty), Stub::Atomic(AtomicStub::Or), &[leaf, one]);
    let w = b.access_ptr(buf, &[one]);
    let value = b.load(w);
    b.store(w, value);
    b.return_(None);

    atomics::run(&mut module, &Config::default()).unwrap();
    validate(&module, Capabilities::EMPTY).unwrap();

    let dump = dump_module(&module);
    assert!(dump.contains("Inner_atomic = struct { x: atomic<u32>, y: u32 }"));
    assert!(dump.contains("Mid_atomic = struct { inner: Inner_atomic, z: u32 }"));
    assert!(dump.contains("Outer_atomic = struct { mid: Mid_atomic, w: u32 }"));
    assert!(dump.contains("%buf: ptr<storage, Outer_atomic, read_write>"));
    assert!(dump.contains("atomicOr"));
}

#[test]
fn one_version_per_argument_combination() {
    let mut module = Module::new();
    let u32_ty = module.u32_ty();
    let a = storage(&mut module, "a", u32_ty, 0);
    let plain = storage(&mut module, "plain", u32_ty, 1);
    let ptr = module.pointer_ty(AddressSpace::Storage, u32_ty, StorageAccess::LOAD_STORE);

    // fn sum(p, q) -> u32 { return *p + *q; }
    let sum = module.new_function("sum", Some(u32_ty), None);
    let p = module.add_param(sum, ptr, "p");
    let q = module.add_param(sum, ptr, "q");
    let body = module.functions[sum].block;
    let mut b = Builder::at_end(&mut module, body);
    let vp = b.load(p);
    let vq = b.load(q);
    let total = b.binary(BinaryOp::Add, vp, vq);
    b.return_(Some(total));

    let block = entry_block(&mut module);
    let mut b = Builder::at_end(&mut module, block);
    let one = b.u32(1);
    b.stub(Some(u32_ty), Stub::Atomic(AtomicStub::ISub), &[a, one]);
    for args in [[a, plain], [plain, a], [a, a], [plain, plain], [a, plain]] {
        b.call(sum, &args);
    }
    b.return_(None);

    let out = atomics::run(&mut module, &Config::default()).unwrap();
    validate(&module, Capabilities::EMPTY).unwrap();

    // Four distinct combinations: the original plus three clones.
    assert_eq!(out.cloned_functions, 3);
    let names: Vec<_> = module
        .function_order
        .iter()
        .map(|&f| module.functions[f].name.as_str())
        .filter(|name| name.starts_with("sum"))
        .collect();
    assert_eq!(names.len(), 4);

    let dump = dump_module(&module);
    assert!(dump.contains(
        "fn sum(%p: ptr<storage, u32, read_write>, %q: ptr<storage, u32, read_write>)"
    ));
    assert!(dump.contains(
        "(%p: ptr<storage, atomic<u32>, read_write>, %q: ptr<storage, atomic<u32>, read_write>)"
    ));
    assert!(dump.contains("atomicLoad %p"));
    assert!(dump.contains("atomicSub %a, 1u"));
}

#[test]
fn workgroup_memory_is_supported() {
    let mut module = Module::new();
    let u32_ty = module.u32_ty();
    let array = module.array_ty(u32_ty, ArraySize::Constant(4), 4);
    let root = module.root;
    let bins = Builder::at_end(&mut module, root).var(
        "bins",
        AddressSpace::Workgroup,
        array,
        StorageAccess::LOAD_STORE,
        None,
    );

    let block = entry_block(&mut module);
    let mut b = Builder::at_end(&mut module, block);
    let two = b.u32(2);
    let slot = b.access_ptr(bins, &[two]);
    let one = b.u32(1);
    b.stub(Some(u32_ty), Stub::Atomic(AtomicStub::Exchange), &[slot, one]);
    let all = b.load(bins);
    let _ = b.access(u32_ty, all, &[two]);
    b.return_(None);

    atomics::run(&mut module, &Config::default()).unwrap();
    validate(&module, Capabilities::EMPTY).unwrap();
    let dump = dump_module(&module);
    assert!(dump.contains("%bins: ptr<workgroup, array<atomic<u32>, 4>, read_write>"));
    assert!(dump.contains("atomicExchange"));
    // The whole-array load is rebuilt from per-element atomic loads.
    assert_eq!(dump.matches("atomicLoad").count(), 4);
}

fn function_names(module: &Module) -> Vec<&str> {
    module
        .function_order
        .iter()
        .map(|&f| module.functions[f].name.as_str())
        .collect()
}

#[test]
fn stub_two_calls_deep() {
    let mut module = Module::new();
    let u32_ty = module.u32_ty();
    let counter = storage(&mut module, "counter", u32_ty, 0);
    let ptr = module.pointer_ty(AddressSpace::Storage, u32_ty, StorageAccess::LOAD_STORE);

    // fn f(p) { atomic_iincrement(p); }
    let f = module.new_function("f", None, None);
    let p = module.add_param(f, ptr, "p");
    let body = module.functions[f].block;
    let mut b = Builder::at_end(&mut module, body);
    b.stub(Some(u32_ty), Stub::Atomic(AtomicStub::IIncrement), &[p]);
    b.return_(None);

    // fn g(q) { f(q); }
    let g = module.new_function("g", None, None);
    let q = module.add_param(g, ptr, "q");
    let body = module.functions[g].block;
    let mut b = Builder::at_end(&mut module, body);
    b.call(f, &[q]);
    b.return_(None);

    let block = entry_block(&mut module);
    let mut b = Builder::at_end(&mut module, block);
    b.call(g, &[counter]);
    b.return_(None);
    validate(&module, Capabilities::ALLOW_STUBS).unwrap();

    let out = atomics::run(&mut module, &Config::default()).unwrap();
    validate(&module, Capabilities::EMPTY).unwrap();

    // Both versions replace their originals outright.
    assert_eq!(out.cloned_functions, 0);
    assert_eq!(out.lowered_stubs, 1);
    assert_eq!(function_names(&module), ["f", "g", "main"]);
    let dump = dump_module(&module);
    assert!(dump.contains("fn f(%p: ptr<storage, atomic<u32>, read_write>)"));
    assert!(dump.contains("fn g(%q: ptr<storage, atomic<u32>, read_write>)"));
    assert!(dump.contains("atomicAdd %p, 1u"));
    assert!(!dump.contains("atomic_iincrement"));
}

#[test]
fn clone_names_skip_existing_functions() {
    let mut module = Module::new();
    let u32_ty = module.u32_ty();
    let a = storage(&mut module, "a", u32_ty, 0);
    let plain = storage(&mut module, "plain", u32_ty, 1);
    let ptr = module.pointer_ty(AddressSpace::Storage, u32_ty, StorageAccess::LOAD_STORE);

    let read = module.new_function("read", Some(u32_ty), None);
    let p = module.add_param(read, ptr, "p");
    let body = module.functions[read].block;
    let mut b = Builder::at_end(&mut module, body);
    let value = b.load(p);
    b.return_(Some(value));

    let taken = module.new_function("read_1", None, None);
    let body = module.functions[taken].block;
    Builder::at_end(&mut module, body).return_(None);

    let block = entry_block(&mut module);
    let mut b = Builder::at_end(&mut module, block);
    let one = b.u32(1);
    b.stub(Some(u32_ty), Stub::Atomic(AtomicStub::IAdd), &[a, one]);
    b.call(read, &[a]);
    b.call(read, &[plain]);
    b.return_(None);

    let out = atomics::run(&mut module, &Config::default()).unwrap();
    validate(&module, Capabilities::EMPTY).unwrap();
    assert_eq!(out.cloned_functions, 1);
    assert_eq!(function_names(&module), ["read", "read_2", "read_1", "main"]);
    assert!(dump_module(&module).contains("fn read_2(%p: ptr<storage, atomic<u32>, read_write>)"));
}
