#![no_main]

use libfuzzer_sys::fuzz_target;
use prism_ir::{Capabilities, Module, validate};
use prism_transform::{
    Atomics, FlattenBindings, MultiplanarExternalTexture, Pipeline, Robustness, Target, atomics,
    generate_bindings, multiplanar_external_texture, robustness,
};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(mut module) = Module::from_json(text) else {
        return;
    };
    // Decoding must never panic; transforms only see modules the validator
    // accepts.
    if validate(&module, Capabilities::ALLOW_STUBS).is_err() {
        return;
    }
    let Ok(bindings) = generate_bindings(&module, Target::Msl) else {
        return;
    };
    let bindings = bindings.external_texture_map();
    let Ok(robustness) = Robustness::new(robustness::Config::default()) else {
        return;
    };
    let pipeline = Pipeline::new()
        .with(Atomics::new(atomics::Config::default()))
        .with(MultiplanarExternalTexture::new(
            multiplanar_external_texture::Config { bindings },
        ))
        .with(robustness)
        .with(FlattenBindings);
    let _ = pipeline.run(&mut module);
});
