// Build script to compile GLSL shaders to SPIR-V
//
// Missing glslc only warns: the library builds without it, and the demo
// reports the missing .spv at runtime.

use std::path::Path;
use std::process::Command;

const SHADERS: [&str; 4] = [
    "shaders/unlit.vert",
    "shaders/unlit.frag",
    "shaders/physical.vert",
    "shaders/physical.frag",
];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    for shader in SHADERS {
        compile_shader(shader, &format!("{}.spv", shader));
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    if !input_path.exists() {
        println!("cargo:warning=Shader source {} not found", input);
        return;
    }

    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            println!("cargo:warning=Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), skipping {}", e, input);
            println!("cargo:warning=Compile manually: glslc {} -o {}", input, output);
        }
    }
}
