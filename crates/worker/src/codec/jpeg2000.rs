//! JPEG 2000 codestreams through OpenJPEG
//!
//! Only single-component 8-bit images go in or come out, which is all a tiled
//! feature map needs. Without a byte target the reversible 5/3 path is used
//! and the round trip is exact; with one, OpenJPEG's rate allocation is asked
//! for the matching compression ratio.

use openjpeg_sys as opj;
use splitinfer_common::{Result, SplitInferError};
use std::ffi::c_void;
use std::mem;
use std::ptr::{self, NonNull};
use tracing::trace;

const STREAM_CHUNK: usize = 1 << 20;
const MAX_RESOLUTIONS: u32 = 6;

fn codec_error(message: &str) -> SplitInferError {
    SplitInferError::codec(format!("jpeg2000 {}", message))
}

struct Codec(NonNull<opj::opj_codec_t>);

impl Codec {
    fn compress() -> Result<Self> {
        let raw = unsafe { opj::opj_create_compress(opj::CODEC_FORMAT::OPJ_CODEC_J2K) };
        NonNull::new(raw)
            .map(Codec)
            .ok_or_else(|| codec_error("cannot create encoder"))
    }

    fn decompress() -> Result<Self> {
        let raw = unsafe { opj::opj_create_decompress(opj::CODEC_FORMAT::OPJ_CODEC_J2K) };
        NonNull::new(raw)
            .map(Codec)
            .ok_or_else(|| codec_error("cannot create decoder"))
    }

    fn ptr(&self) -> *mut opj::opj_codec_t {
        self.0.as_ptr()
    }
}

impl Drop for Codec {
    fn drop(&mut self) {
        unsafe { opj::opj_destroy_codec(self.0.as_ptr()) }
    }
}

struct Stream(NonNull<opj::opj_stream_t>);

impl Stream {
    fn new(input: bool) -> Result<Self> {
        let raw = unsafe { opj::opj_stream_create(STREAM_CHUNK as _, input as _) };
        NonNull::new(raw)
            .map(Stream)
            .ok_or_else(|| codec_error("cannot create stream"))
    }

    fn ptr(&self) -> *mut opj::opj_stream_t {
        self.0.as_ptr()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        unsafe { opj::opj_stream_destroy(self.0.as_ptr()) }
    }
}

struct Image(NonNull<opj::opj_image_t>);

impl Image {
    fn ptr(&self) -> *mut opj::opj_image_t {
        self.0.as_ptr()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        unsafe { opj::opj_image_destroy(self.0.as_ptr()) }
    }
}

/// Seekable buffer the encoder writes into
#[derive(Default)]
struct Sink {
    data: Vec<u8>,
    pos: usize,
}

impl Sink {
    fn move_to(&mut self, pos: usize) {
        self.pos = pos;
        if self.data.len() < pos {
            self.data.resize(pos, 0);
        }
    }
}

unsafe extern "C" fn sink_write(
    buffer: *mut c_void,
    len: opj::OPJ_SIZE_T,
    user: *mut c_void,
) -> opj::OPJ_SIZE_T {
    let sink = &mut *(user as *mut Sink);
    let src = std::slice::from_raw_parts(buffer as *const u8, len as usize);
    let start = sink.pos;
    sink.move_to(start + src.len());
    sink.data[start..sink.pos].copy_from_slice(src);
    len
}

unsafe extern "C" fn sink_skip(len: opj::OPJ_OFF_T, user: *mut c_void) -> opj::OPJ_OFF_T {
    let sink = &mut *(user as *mut Sink);
    let target = sink.pos as i64 + len as i64;
    if target < 0 {
        return -1;
    }
    sink.move_to(target as usize);
    len
}

unsafe extern "C" fn sink_seek(pos: opj::OPJ_OFF_T, user: *mut c_void) -> opj::OPJ_BOOL {
    let sink = &mut *(user as *mut Sink);
    if (pos as i64) < 0 {
        return 0;
    }
    sink.move_to(pos as usize);
    1
}

/// Read cursor over the received payload
struct Source<'a> {
    data: &'a [u8],
    pos: usize,
}

unsafe extern "C" fn source_read(
    buffer: *mut c_void,
    len: opj::OPJ_SIZE_T,
    user: *mut c_void,
) -> opj::OPJ_SIZE_T {
    let source = &mut *(user as *mut Source<'_>);
    let remaining = &source.data[source.pos..];
    if remaining.is_empty() {
        return opj::OPJ_SIZE_T::MAX;
    }
    let n = remaining.len().min(len as usize);
    ptr::copy_nonoverlapping(remaining.as_ptr(), buffer as *mut u8, n);
    source.pos += n;
    n as opj::OPJ_SIZE_T
}

unsafe extern "C" fn source_skip(len: opj::OPJ_OFF_T, user: *mut c_void) -> opj::OPJ_OFF_T {
    let source = &mut *(user as *mut Source<'_>);
    let target = source.pos as i64 + len as i64;
    if target < 0 || target > source.data.len() as i64 {
        return -1;
    }
    source.pos = target as usize;
    len
}

unsafe extern "C" fn source_seek(pos: opj::OPJ_OFF_T, user: *mut c_void) -> opj::OPJ_BOOL {
    let source = &mut *(user as *mut Source<'_>);
    let pos = pos as i64;
    if pos < 0 || pos > source.data.len() as i64 {
        return 0;
    }
    source.pos = pos as usize;
    1
}

/// Decomposition levels that still leave every resolution at least one pixel
fn resolutions(shortest_side: usize) -> u32 {
    let levels = usize::BITS - shortest_side.max(1).leading_zeros();
    levels.clamp(1, MAX_RESOLUTIONS)
}

/// OpenJPEG rate: raw size over target size, 0 meaning lossless
fn compression_ratio(raw_bytes: usize, target_bytes: Option<usize>) -> f32 {
    match target_bytes {
        Some(target) if target < raw_bytes => raw_bytes as f32 / target.max(1) as f32,
        _ => 0.0,
    }
}

/// Encode an 8-bit grayscale image as a raw J2K codestream
pub fn encode_gray(
    pixels: &[u8],
    width: usize,
    height: usize,
    target_bytes: Option<usize>,
) -> Result<Vec<u8>> {
    if width == 0 || height == 0 || pixels.len() != width * height {
        return Err(codec_error(&format!(
            "needs {}x{} pixels, got {}",
            height,
            width,
            pixels.len()
        )));
    }
    let (w, h) = match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => return Err(codec_error("image too large")),
    };

    let mut component: opj::opj_image_cmptparm_t = unsafe { mem::zeroed() };
    component.dx = 1;
    component.dy = 1;
    component.w = w;
    component.h = h;
    component.prec = 8;

    let raw = unsafe { opj::opj_image_create(1, &mut component, opj::COLOR_SPACE::OPJ_CLRSPC_GRAY) };
    let image = NonNull::new(raw)
        .map(Image)
        .ok_or_else(|| codec_error("cannot allocate image"))?;
    unsafe {
        let raw = &mut *image.ptr();
        raw.x0 = 0;
        raw.y0 = 0;
        raw.x1 = w;
        raw.y1 = h;
        let plane = (*raw.comps).data;
        if plane.is_null() {
            return Err(codec_error("cannot allocate image plane"));
        }
        let plane = std::slice::from_raw_parts_mut(plane, pixels.len());
        for (dst, &src) in plane.iter_mut().zip(pixels) {
            *dst = src as _;
        }
    }

    let mut params: opj::opj_cparameters_t = unsafe { mem::zeroed() };
    unsafe { opj::opj_set_default_encoder_parameters(&mut params) };
    params.numresolution = resolutions(width.min(height)) as _;
    params.tcp_numlayers = 1;
    params.cp_disto_alloc = 1;
    params.tcp_rates[0] = compression_ratio(pixels.len(), target_bytes);

    let codec = Codec::compress()?;
    if unsafe { opj::opj_setup_encoder(codec.ptr(), &mut params, image.ptr()) } == 0 {
        return Err(codec_error("rejected encoder parameters"));
    }

    let mut sink = Sink::default();
    let stream = Stream::new(false)?;
    let encoded = unsafe {
        opj::opj_stream_set_write_function(stream.ptr(), Some(sink_write));
        opj::opj_stream_set_skip_function(stream.ptr(), Some(sink_skip));
        opj::opj_stream_set_seek_function(stream.ptr(), Some(sink_seek));
        opj::opj_stream_set_user_data(stream.ptr(), &mut sink as *mut Sink as *mut c_void, None);

        opj::opj_start_compress(codec.ptr(), image.ptr(), stream.ptr()) != 0
            && opj::opj_encode(codec.ptr(), stream.ptr()) != 0
            && opj::opj_end_compress(codec.ptr(), stream.ptr()) != 0
    };
    drop(stream);

    if !encoded {
        return Err(codec_error("encode failed"));
    }
    trace!(
        "Encoded {}x{} jpeg2000 at ratio {} into {} bytes",
        height,
        width,
        params.tcp_rates[0],
        sink.data.len()
    );
    Ok(sink.data)
}

/// Decode a J2K codestream into `(width, height, pixels)` of 8-bit gray
pub fn decode_gray(bytes: &[u8]) -> Result<(usize, usize, Vec<u8>)> {
    let codec = Codec::decompress()?;
    let mut params: opj::opj_dparameters_t = unsafe { mem::zeroed() };
    unsafe { opj::opj_set_default_decoder_parameters(&mut params) };
    if unsafe { opj::opj_setup_decoder(codec.ptr(), &mut params) } == 0 {
        return Err(codec_error("rejected decoder parameters"));
    }

    let mut source = Source { data: bytes, pos: 0 };
    let stream = Stream::new(true)?;
    unsafe {
        opj::opj_stream_set_read_function(stream.ptr(), Some(source_read));
        opj::opj_stream_set_skip_function(stream.ptr(), Some(source_skip));
        opj::opj_stream_set_seek_function(stream.ptr(), Some(source_seek));
        opj::opj_stream_set_user_data(
            stream.ptr(),
            &mut source as *mut Source<'_> as *mut c_void,
            None,
        );
        opj::opj_stream_set_user_data_length(stream.ptr(), bytes.len() as _);
    }

    let mut raw: *mut opj::opj_image_t = ptr::null_mut();
    let header_read = unsafe { opj::opj_read_header(stream.ptr(), codec.ptr(), &mut raw) } != 0;
    let image = match (header_read, NonNull::new(raw).map(Image)) {
        (true, Some(image)) => image,
        _ => return Err(codec_error("payload is not a codestream")),
    };

    let decoded = unsafe {
        opj::opj_decode(codec.ptr(), stream.ptr(), image.ptr()) != 0
            && opj::opj_end_decompress(codec.ptr(), stream.ptr()) != 0
    };
    if !decoded {
        return Err(codec_error("decode failed"));
    }

    unsafe {
        let raw = &*image.ptr();
        if raw.numcomps != 1 || raw.comps.is_null() {
            return Err(codec_error(&format!(
                "expected one component, found {}",
                raw.numcomps
            )));
        }
        let component = &*raw.comps;
        if component.data.is_null() {
            return Err(codec_error("decoder produced no samples"));
        }

        let (width, height) = (component.w as usize, component.h as usize);
        let shift = component.prec.saturating_sub(8);
        let samples = std::slice::from_raw_parts(component.data, width * height);
        let pixels = samples
            .iter()
            .map(|&v| (v >> shift).clamp(0, 255) as u8)
            .collect();
        Ok((width, height, pixels))
    }
}
