//! Attribute key constants for Attrs access.
//!
//! Avoid string typos, enable IDE autocomplete.
//! Usage: `node.attrs().get_float(A_SCALE)`

// === Identity ===
/// Human-readable name
pub const A_NAME: &str = "name";

// === Timing ===
/// Output frames per second (0.0 = adopt detected input fps)
pub const A_OUTPUT_FPS: &str = "output.fps";

// === Linear retime ===
/// Visual time scale (2.0 doubles the output length)
pub const A_SCALE: &str = "visual.scale";
/// Visual frame offset
pub const A_OFFSET: &str = "visual.offset";
/// Audio time scale, applied on top of the visual scale
pub const A_AUDIO_SCALE: &str = "audio.scale";
/// Audio time offset in seconds
pub const A_AUDIO_OFFSET: &str = "audio.offset";

// === Non-linear warp ===
/// Warp enabled
pub const A_WARP_ACTIVE: &str = "warp.active";
/// 0 = linear key interpolation, 1 = hold
pub const A_WARP_STYLE: &str = "warp.style";
/// Key input frames (IntList, same length as rates)
pub const A_WARP_KEY_FRAMES: &str = "warp.keyFrames";
/// Key rate multipliers (FloatList)
pub const A_WARP_KEY_RATES: &str = "warp.keyRates";

// === Explicit remap ===
/// Explicit table enabled; takes precedence over other retime styles
pub const A_EXPLICIT_ACTIVE: &str = "explicit.active";
/// Output frame mapped by table index 0
pub const A_EXPLICIT_FIRST_OUTPUT: &str = "explicit.firstOutputFrame";
/// Input frame per output offset (IntList)
pub const A_EXPLICIT_INPUT_FRAMES: &str = "explicit.inputFrames";

// === Stack ===
/// Aggregate child ranges over cut-in/cut-out instead of start/end
pub const A_USE_CUT_INFO: &str = "mode.useCutInfo";
/// Align all children to a common start frame
pub const A_ALIGN_START: &str = "mode.alignStartFrames";
/// Skip children whose remapped frame is outside their own range
pub const A_STRICT_RANGES: &str = "mode.strictFrameRanges";
/// Composite type ("over", "add", "difference", "replace", "topmost")
pub const A_COMP_MODE: &str = "composite.type";
/// Derive output size from the largest child
pub const A_AUTO_SIZE: &str = "output.autoSize";
/// Output width when autoSize is off
pub const A_OUT_WIDTH: &str = "output.width";
/// Output height when autoSize is off
pub const A_OUT_HEIGHT: &str = "output.height";
/// Audio source selector: -2 = sum all, -1 = topmost, -3 = first with audio,
/// >= 0 = that input only
pub const A_AUDIO_INPUT: &str = "audio.input";
