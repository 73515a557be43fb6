use async_channel::{Receiver, Sender};
use bevy::asset::Handle;
use bevy::image::Image;
use bevy::log::warn;
use bevy::math::IVec3;
use bevy::platform::collections::HashMap;
use bevy::prelude::Resource;

/// Row alignment required for texture-to-buffer copies.
pub const COPY_BYTES_PER_ROW_ALIGNMENT: u32 = 256;

/// Round up a given value to be a multiple of [`COPY_BYTES_PER_ROW_ALIGNMENT`].
pub const fn align_byte_size(value: u32) -> u32 {
    value.div_ceil(COPY_BYTES_PER_ROW_ALIGNMENT) * COPY_BYTES_PER_ROW_ALIGNMENT
}

/// Size of a texture buffer once each row is aligned for copying.
pub const fn get_aligned_size(width: u32, height: u32, pixel_size: u32) -> u32 {
    height * align_byte_size(width * pixel_size)
}

/// A pending GPU→CPU texture readback request, drained by the render driver.
///
/// The driver fills a tightly packed 4-byte-per-texel buffer and sends it
/// through `tx`; the owning tile polls the matching [`ReadbackHandle`].
#[derive(Debug, Clone)]
pub struct ReadbackRequest {
    pub source: Handle<Image>,
    pub tx: Sender<Vec<u8>>,
}

/// Readback request queue populated by the main world.
#[derive(Resource, Default, Debug)]
pub struct ReadbackQueue {
    requests: Vec<ReadbackRequest>,
}

impl ReadbackQueue {
    /// Begin an async readback of `source`. Never blocks; completion is
    /// observed by polling the returned handle on a later tick.
    pub fn begin(&mut self, source: Handle<Image>) -> ReadbackHandle {
        let (tx, rx) = async_channel::bounded(1);
        self.requests.push(ReadbackRequest { source, tx });
        ReadbackHandle { rx, data: None }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn drain(&mut self) -> Vec<ReadbackRequest> {
        std::mem::take(&mut self.requests)
    }
}

/// Completion side of one in-flight readback. Single producer, single
/// consumer; `poll` is the only wait primitive.
#[derive(Debug)]
pub struct ReadbackHandle {
    rx: Receiver<Vec<u8>>,
    data: Option<Vec<u8>>,
}

impl ReadbackHandle {
    /// Poll for completion. Returns true once the raw bytes have arrived.
    pub fn poll(&mut self) -> bool {
        if self.data.is_none() {
            if let Ok(bytes) = self.rx.try_recv() {
                self.data = Some(bytes);
            }
        }
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn take_data(&mut self) -> Option<Vec<u8>> {
        self.data.take()
    }
}

/// CPU-side staging buffer pool, keyed by buffer size. Buffers idle for more
/// than `max_unused_frames` frames are retired to bound memory.
#[derive(Resource, Debug)]
pub struct ReadbackBufferPool {
    buffers: HashMap<usize, Vec<PooledBuffer>>,
    max_unused_frames: usize,
}

#[derive(Debug)]
struct PooledBuffer {
    bytes: Vec<u8>,
    frames_unused: usize,
}

impl Default for ReadbackBufferPool {
    fn default() -> Self {
        Self {
            buffers: HashMap::new(),
            max_unused_frames: 10,
        }
    }
}

impl ReadbackBufferPool {
    pub fn get(&mut self, size: usize) -> Vec<u8> {
        if let Some(pool) = self.buffers.get_mut(&size) {
            if let Some(buf) = pool.pop() {
                return buf.bytes;
            }
        }
        vec![0; size]
    }

    pub fn return_buffer(&mut self, mut bytes: Vec<u8>) {
        if bytes.is_empty() {
            warn!("returned an empty readback buffer");
            return;
        }
        let size = bytes.len();
        bytes.fill(0);
        self.buffers.entry(size).or_default().push(PooledBuffer {
            bytes,
            frames_unused: 0,
        });
    }

    /// Tick idle counters and retire stale buffers.
    pub fn update(&mut self) {
        let max_unused = self.max_unused_frames;
        for pool in self.buffers.values_mut() {
            for buf in pool.iter_mut() {
                buf.frames_unused += 1;
            }
            pool.retain(|buf| buf.frames_unused < max_unused);
        }
        self.buffers.retain(|_, pool| !pool.is_empty());
    }
}

// --- packed texel codecs ---

/// Decode one height texel: bytes [0,1,2] form a 24-bit sign-extended integer
/// (byte 2's top bit is the sign, replicated into bits 24-31), byte [3] is the
/// 8-bit material index.
pub fn decode_height_texel(texel: [u8; 4]) -> (i32, u8) {
    let mut raw = texel[0] as u32 | (texel[1] as u32) << 8 | (texel[2] as u32) << 16;
    if texel[2] & 0x80 != 0 {
        raw |= 0xFF00_0000;
    }
    (raw as i32, texel[3])
}

/// Inverse of [`decode_height_texel`]; used by tests and driver fakes.
/// Heights outside the representable 24-bit range are clamped.
pub fn encode_height_texel(height: i32, material: u8) -> [u8; 4] {
    let clamped = height.clamp(-(1 << 23), (1 << 23) - 1) as u32;
    [
        (clamped & 0xFF) as u8,
        ((clamped >> 8) & 0xFF) as u8,
        ((clamped >> 16) & 0xFF) as u8,
        material,
    ]
}

/// Packed integer height to world height.
pub fn world_height(packed: i32, height_scale: f32) -> f32 {
    packed as f32 / height_scale
}

/// Decode a collision tile readback into per-vertex world heights plus
/// material indices. `bytes` must be tightly packed, `resolution²` texels.
pub fn decode_collision_texture(
    bytes: &[u8],
    resolution: u32,
    height_scale: f32,
) -> (Vec<f32>, Vec<u8>) {
    let texels: &[[u8; 4]] = bytemuck::cast_slice(bytes);
    let count = (resolution * resolution) as usize;
    debug_assert!(texels.len() >= count);
    let mut heights = Vec::with_capacity(count);
    let mut materials = Vec::with_capacity(count);
    for texel in &texels[..count] {
        let (packed, material) = decode_height_texel(*texel);
        heights.push(world_height(packed, height_scale));
        materials.push(material);
    }
    (heights, materials)
}

/// One decoded spawnable instance record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpawnRecord {
    /// Packed integer offsets, world units = raw / height_scale.
    pub position_raw: IVec3,
    /// Degrees in [0, 360).
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    /// Uniform scale in [0, 20].
    pub scale: f32,
}

/// Decode one 2×2 texel block: (0,0)=X, (1,0)=Y, (0,1)=Z, (1,1)=RotScale.
///
/// Each axis reconstructs a sign-extended integer from its texel's first
/// three channels, the same layout as the height codec. The X texel's alpha
/// is the occupancy flag; zero means no instance in this record.
pub fn decode_spawn_record(x: [u8; 4], y: [u8; 4], z: [u8; 4], rot_scale: [u8; 4]) -> Option<SpawnRecord> {
    if x[3] == 0 {
        return None;
    }
    let (px, _) = decode_height_texel([x[0], x[1], x[2], 0]);
    let (py, _) = decode_height_texel([y[0], y[1], y[2], 0]);
    let (pz, _) = decode_height_texel([z[0], z[1], z[2], 0]);
    Some(SpawnRecord {
        position_raw: IVec3::new(px, py, pz),
        yaw: rot_scale[0] as f32 / 255.0 * 360.0,
        pitch: rot_scale[1] as f32 / 255.0 * 360.0,
        roll: rot_scale[2] as f32 / 255.0 * 360.0,
        scale: rot_scale[3] as f32 / 255.0 * 20.0,
    })
}

/// Decode a spawnable density/transform readback. The texture is a grid of
/// 2×2 record blocks; `width`/`height` are texel dimensions, tightly packed.
pub fn decode_spawn_texture(bytes: &[u8], width: u32, height: u32) -> Vec<SpawnRecord> {
    let texels: &[[u8; 4]] = bytemuck::cast_slice(bytes);
    debug_assert!(texels.len() >= (width * height) as usize);
    let mut records = Vec::new();
    let w = width as usize;
    for block_y in 0..(height / 2) {
        for block_x in 0..(width / 2) {
            let tx = block_x as usize * 2;
            let ty = block_y as usize * 2;
            let x = texels[ty * w + tx];
            let y = texels[ty * w + tx + 1];
            let z = texels[(ty + 1) * w + tx];
            let rot_scale = texels[(ty + 1) * w + tx + 1];
            if let Some(record) = decode_spawn_record(x, y, z, rot_scale) {
                records.push(record);
            }
        }
    }
    records
}
