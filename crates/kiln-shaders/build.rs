//! Build script to compile GLSL shaders to SPIR-V.

use shaderc::{Compiler, IncludeType, ResolvedInclude, ShaderKind};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const SHADERS: [(&str, ShaderKind); 6] = [
    ("quad.vert", ShaderKind::Vertex),
    ("quad.frag", ShaderKind::Fragment),
    ("line.vert", ShaderKind::Vertex),
    ("line.frag", ShaderKind::Fragment),
    ("mesh.vert", ShaderKind::Vertex),
    ("mesh.frag", ShaderKind::Fragment),
];

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let shader_dir = Path::new("shaders");

    println!("cargo:rerun-if-changed=shaders/");

    let compiler = Compiler::new().expect("Failed to create shader compiler");

    for (file, kind) in SHADERS {
        let output = out_dir.join(format!("{}.spv", file.replace('.', "_")));
        compile_shader(&compiler, shader_dir, &shader_dir.join(file), &output, kind);
    }
}

fn compile_shader(
    compiler: &Compiler,
    shader_dir: &Path,
    input: &Path,
    output: &Path,
    kind: ShaderKind,
) {
    let source = fs::read_to_string(input)
        .unwrap_or_else(|e| panic!("Failed to read shader {input:?}: {e}"));
    let file_name = input.file_name().unwrap().to_str().unwrap();

    let mut options = shaderc::CompileOptions::new().expect("Failed to create compile options");
    options.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_2 as u32,
    );
    options.set_target_spirv(shaderc::SpirvVersion::V1_5);
    options.set_optimization_level(shaderc::OptimizationLevel::Performance);
    let include_dir = shader_dir.to_path_buf();
    options.set_include_callback(move |name, _ty: IncludeType, _from, _depth| {
        let path = include_dir.join(name);
        let content = fs::read_to_string(&path).map_err(|e| format!("{}: {e}", path.display()))?;
        Ok(ResolvedInclude {
            resolved_name: path.display().to_string(),
            content,
        })
    });

    let result = compiler
        .compile_into_spirv(&source, kind, file_name, "main", Some(&options))
        .unwrap_or_else(|e| panic!("Failed to compile shader {input:?}: {e}"));

    if result.get_num_warnings() > 0 {
        println!("cargo:warning=Shader warnings in {input:?}: {}", result.get_warning_messages());
    }

    fs::write(output, bytemuck::cast_slice::<u32, u8>(result.as_binary()))
        .unwrap_or_else(|e| panic!("Failed to write shader {output:?}: {e}"));
}
