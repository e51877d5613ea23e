//! Built-in shaders for the Kiln renderer.
//!
//! GLSL sources live in `shaders/` and are compiled to SPIR-V at build time
//! with shaderc. Every vertex shader reads the camera uniform at set 0,
//! binding 0. The mesh vertex shader takes a 64-byte model matrix as a push
//! constant. The quad and line vertex shaders take the 16-byte batch block
//! from `batch.glsl`, whose object count clips vertices past the flush.

use std::sync::OnceLock;

/// SPIR-V magic number, first word of every module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

mod spirv_bytes {
    pub static QUAD_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/quad_vert.spv"));
    pub static QUAD_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/quad_frag.spv"));
    pub static LINE_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/line_vert.spv"));
    pub static LINE_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/line_frag.spv"));
    pub static MESH_VERT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh_vert.spv"));
    pub static MESH_FRAG: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/mesh_frag.spv"));
}

/// Convert SPIR-V bytes to words. Trailing bytes that do not fill a word are dropped.
pub fn bytes_to_spirv(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Vertex and fragment stage of one built-in program.
#[derive(Clone, Copy, Debug)]
pub struct Program {
    pub vertex: &'static [u32],
    pub fragment: &'static [u32],
}

macro_rules! program {
    ($name:ident, $vert:ident, $frag:ident) => {
        pub fn $name() -> Program {
            static VERT: OnceLock<Vec<u32>> = OnceLock::new();
            static FRAG: OnceLock<Vec<u32>> = OnceLock::new();
            Program {
                vertex: VERT.get_or_init(|| bytes_to_spirv(spirv_bytes::$vert)),
                fragment: FRAG.get_or_init(|| bytes_to_spirv(spirv_bytes::$frag)),
            }
        }
    };
}

program!(quad, QUAD_VERT, QUAD_FRAG);
program!(line, LINE_VERT, LINE_FRAG);
program!(mesh, MESH_VERT, MESH_FRAG);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_programs_are_spirv() {
        for program in [quad(), line(), mesh()] {
            assert_eq!(program.vertex[0], SPIRV_MAGIC);
            assert_eq!(program.fragment[0], SPIRV_MAGIC);
            assert!(program.vertex.len() > 20);
        }
    }

    #[test]
    fn partial_words_are_dropped() {
        assert_eq!(bytes_to_spirv(&[0x03, 0x02, 0x23, 0x07, 0xff]), [SPIRV_MAGIC]);
    }
}
