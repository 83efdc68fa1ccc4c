// Copyright 2024 ananbox Authors
// SPDX-License-Identifier: Apache-2.0

//! Texture compositor
//!
//! Draws a texture as a quad filling the current viewport. The program and
//! geometry are built once; if that fails the compositor stays disabled and
//! every draw returns `false` without touching the driver.

use std::sync::Arc;

use log::error;

use crate::context::{with_context, ContextBinder, ScopedContext};
use crate::gles::{BufferId, BufferTarget, GlesDriver, ProgramId, ShaderId, ShaderKind, TextureId};

pub const VERTEX_SHADER: &str = "attribute vec4 position;
attribute vec2 inCoord;
varying lowp vec2 outCoord;
void main(void) {
  gl_Position.x = position.x;
  gl_Position.y = position.y;
  gl_Position.zw = position.zw;
  outCoord = inCoord;
}
";

pub const FRAGMENT_SHADER: &str = "varying lowp vec2 outCoord;
uniform sampler2D texture;
void main(void) {
  gl_FragColor = texture2D(texture, outCoord);
}
";

/// Position (x, y, z) then texture coordinate (u, v)
const VERTICES: [[f32; 5]; 4] = [
    [1.0, -1.0, 0.0, 1.0, 1.0],
    [1.0, 1.0, 0.0, 1.0, 0.0],
    [-1.0, 1.0, 0.0, 0.0, 0.0],
    [-1.0, -1.0, 0.0, 0.0, 1.0],
];
const INDICES: [u8; 6] = [0, 1, 2, 2, 3, 0];
const VERTEX_STRIDE: u32 = 5 * 4;
const COORD_OFFSET: usize = 3 * 4;

pub struct TextureDraw {
    driver: Arc<dyn GlesDriver>,
    binder: Arc<dyn ContextBinder>,
    program: ProgramId,
    position_slot: i32,
    coord_slot: i32,
    texture_slot: i32,
    vertex_buffer: BufferId,
    index_buffer: BufferId,
}

impl TextureDraw {
    pub fn new(driver: Arc<dyn GlesDriver>, binder: Arc<dyn ContextBinder>) -> Self {
        Self::with_sources(driver, binder, VERTEX_SHADER, FRAGMENT_SHADER)
    }

    /// Build the compositor from custom shader sources
    pub fn with_sources(
        driver: Arc<dyn GlesDriver>,
        binder: Arc<dyn ContextBinder>,
        vertex: &str,
        fragment: &str,
    ) -> Self {
        let mut draw = Self {
            driver,
            binder,
            program: ProgramId::NULL,
            position_slot: -1,
            coord_slot: -1,
            texture_slot: -1,
            vertex_buffer: BufferId::NULL,
            index_buffer: BufferId::NULL,
        };
        let binder = Arc::clone(&draw.binder);
        if with_context(&*binder, || draw.build(vertex, fragment)).is_none() {
            error!("texture compositor disabled: host context unavailable");
        }
        draw
    }

    /// Whether the program built successfully
    pub fn is_enabled(&self) -> bool {
        !self.program.is_null()
    }

    fn compile(&self, kind: ShaderKind, source: &str) -> ShaderId {
        let shader = self.driver.create_shader(kind);
        if shader.is_null() {
            return shader;
        }
        self.driver.shader_source(shader, source);
        if !self.driver.compile_shader(shader) {
            error!("failed to compile {kind:?} shader");
            self.driver.delete_shader(shader);
            return ShaderId::NULL;
        }
        shader
    }

    fn build(&mut self, vertex: &str, fragment: &str) {
        let d = Arc::clone(&self.driver);
        let vs = self.compile(ShaderKind::Vertex, vertex);
        let fs = self.compile(ShaderKind::Fragment, fragment);

        let program = d.create_program();
        d.attach_shader(program, vs);
        d.attach_shader(program, fs);
        let linked = d.link_program(program);
        d.delete_shader(vs);
        d.delete_shader(fs);
        if !linked {
            error!(
                "failed to link texture compositor program: {}",
                d.program_info_log(program)
            );
            d.delete_program(program);
            return;
        }

        d.use_program(program);
        self.position_slot = d.attrib_location(program, "position");
        self.coord_slot = d.attrib_location(program, "inCoord");
        self.texture_slot = d.uniform_location(program, "texture");

        let vertices: Vec<u8> = VERTICES
            .iter()
            .flatten()
            .flat_map(|f| f.to_le_bytes())
            .collect();
        self.vertex_buffer = d.gen_buffer();
        d.bind_buffer(BufferTarget::Array, self.vertex_buffer);
        d.buffer_data(BufferTarget::Array, &vertices);

        self.index_buffer = d.gen_buffer();
        d.bind_buffer(BufferTarget::ElementArray, self.index_buffer);
        d.buffer_data(BufferTarget::ElementArray, &INDICES);

        self.program = program;
    }

    /// Draw `texture` over the current viewport
    pub fn draw(&self, texture: TextureId) -> bool {
        if self.program.is_null() {
            return false;
        }
        let scope = ScopedContext::new(&*self.binder);
        if !scope.is_ok() {
            return false;
        }
        let d = &self.driver;

        d.use_program(self.program);
        d.bind_buffer(BufferTarget::Array, self.vertex_buffer);
        d.enable_vertex_attrib_array(self.position_slot);
        d.vertex_attrib_pointer(self.position_slot, 3, VERTEX_STRIDE, 0);
        d.enable_vertex_attrib_array(self.coord_slot);
        d.vertex_attrib_pointer(self.coord_slot, 2, VERTEX_STRIDE, COORD_OFFSET);

        d.active_texture(0);
        d.bind_texture(texture);
        d.uniform_1i(self.texture_slot, 0);

        if !d.validate_program(self.program) {
            error!(
                "texture compositor program failed validation: {}",
                d.program_info_log(self.program)
            );
            return false;
        }

        d.bind_buffer(BufferTarget::ElementArray, self.index_buffer);
        d.draw_elements(INDICES.len() as u32);
        if let Some(err) = d.get_error() {
            error!("texture compositor draw failed: {:#x}", err.code());
        }
        true
    }
}

impl Drop for TextureDraw {
    fn drop(&mut self) {
        if self.program.is_null() {
            return;
        }
        let d = Arc::clone(&self.driver);
        let released = with_context(&*self.binder, || {
            d.delete_buffers(&[self.vertex_buffer, self.index_buffer]);
            d.delete_program(self.program);
        });
        if released.is_none() {
            error!("leaking texture compositor program: host context unavailable");
        }
    }
}
