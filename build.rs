use std::path::Path;
use std::process::Command;
use walkdir::WalkDir;

fn main() {
    let shader_dir = Path::new("assets/shaders");

    println!("cargo:rerun-if-changed=assets/shaders/");
    println!("cargo:rerun-if-changed=build.rs");

    if !shader_dir.is_dir() {
        println!(
            "cargo:warning=No shader directory at {:?}; pass --shader-dir at runtime.",
            shader_dir
        );
        return;
    }

    for entry in WalkDir::new(shader_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let source_path = entry.path();
        let is_glsl = matches!(
            source_path.extension().and_then(|s| s.to_str()),
            Some("vert" | "frag")
        );
        if !is_glsl {
            continue;
        }

        // heightmap.vert -> heightmap.vert.spv
        let mut output_path = source_path.as_os_str().to_owned();
        output_path.push(".spv");

        match Command::new("glslc")
            .arg(source_path)
            .arg("-o")
            .arg(&output_path)
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => panic!(
                "Failed to compile shader {:?}. glslc exited with code: {:?}",
                source_path,
                status.code()
            ),
            Err(e) => {
                // Prebuilt SPIR-V can still be supplied through --shader-dir.
                println!(
                    "cargo:warning=Skipping {:?}: could not run glslc ({}).",
                    source_path, e
                );
            }
        }
    }
}
