//! Guest module for exercising the hostlink bridge.
//!
//! Build with `cargo build --release` in this directory (the target is set to
//! `wasm32-unknown-unknown` in `.cargo/config.toml`), then run it with
//! `hostlink run --canvas screen --frames 3 target/wasm32-unknown-unknown/release/hostlink_test_guest.wasm`.

use std::alloc::{alloc, dealloc, handle_alloc_error, realloc, Layout};
use std::cell::Cell;

// =============================================================================
// Host capability imports
// =============================================================================

#[link(wasm_import_module = "hostlink")]
extern "C" {
    fn object_drop_ref(h: u32);
    fn string_new(ptr: *const u8, len: usize) -> u32;
    fn number_new(n: f64) -> u32;
    fn debug_string(ret: *mut [u32; 2], h: u32);
    fn closure_new(a: u32, b: u32, dtor: u32, trampoline: u32) -> u32;
    fn cb_drop(h: u32) -> u32;
    fn throw(ptr: *const u8, len: usize);
    fn global(ptr: *const u8, len: usize) -> u32;
    fn get_property(obj: u32, ptr: *const u8, len: usize) -> u32;
    fn set_property_f64(obj: u32, ptr: *const u8, len: usize, n: f64);
    fn set_property_string(obj: u32, kptr: *const u8, klen: usize, vptr: *const u8, vlen: usize);
    fn get_property_string(ret: *mut [u32; 2], obj: u32, ptr: *const u8, len: usize);
    fn call_method(obj: u32, ptr: *const u8, len: usize, args: *const u32, nargs: usize) -> u32;
    fn call_method_f64(obj: u32, ptr: *const u8, len: usize, args: *const f64, nargs: usize) -> u32;
    fn console_log(level: i32, h: u32);
    fn request_animation_frame(callback: u32) -> i32;
    fn add_event_listener(target: u32, ptr: *const u8, len: usize, callback: u32);
}

const LOG: i32 = 1;
const WARN: i32 = 3;
const UNDEFINED: u32 = 0;
const NULL: u32 = 1;

// =============================================================================
// Allocator exports
// =============================================================================
// Each block carries its size in an 8-byte header, so `free` and `realloc`
// do not depend on the size the host reports.

const HEADER: usize = 8;

fn layout(size: usize) -> Layout {
    match Layout::from_size_align(size + HEADER, 8) {
        Ok(layout) => layout,
        Err(_) => std::process::abort(),
    }
}

#[no_mangle]
pub unsafe extern "C" fn __hostlink_malloc(size: usize) -> *mut u8 {
    let layout = layout(size);
    let block = alloc(layout);
    if block.is_null() {
        handle_alloc_error(layout);
    }
    (block as *mut usize).write(size);
    block.add(HEADER)
}

#[no_mangle]
pub unsafe extern "C" fn __hostlink_realloc(ptr: *mut u8, _old_size: usize, new_size: usize) -> *mut u8 {
    let block = ptr.sub(HEADER);
    let old_size = (block as *const usize).read();
    let grown = realloc(block, layout(old_size), new_size + HEADER);
    if grown.is_null() {
        handle_alloc_error(layout(new_size));
    }
    (grown as *mut usize).write(new_size);
    grown.add(HEADER)
}

#[no_mangle]
pub unsafe extern "C" fn __hostlink_free(ptr: *mut u8, _size: usize) {
    let block = ptr.sub(HEADER);
    let size = (block as *const usize).read();
    dealloc(block, layout(size));
}

thread_local! {
    static LAST_EXCEPTION: Cell<u32> = const { Cell::new(UNDEFINED) };
    static FRAMES: Cell<u32> = const { Cell::new(0) };
    static FRAME_CALLBACK: Cell<u32> = const { Cell::new(UNDEFINED) };
}

/// Receives host exceptions; the newest one replaces the previous.
#[no_mangle]
pub extern "C" fn __hostlink_exn_store(h: u32) {
    let previous = LAST_EXCEPTION.with(|e| e.replace(h));
    drop_ref(previous);
}

/// Hand the last stored exception to the caller, if any.
#[no_mangle]
pub extern "C" fn take_exception() -> u32 {
    LAST_EXCEPTION.with(|e| e.replace(UNDEFINED))
}

// =============================================================================
// Safe wrappers
// =============================================================================

fn drop_ref(h: u32) {
    if h > NULL + 2 {
        unsafe { object_drop_ref(h) }
    }
}

fn new_string(s: &str) -> u32 {
    unsafe { string_new(s.as_ptr(), s.len()) }
}

fn log(level: i32, message: &str) {
    let h = new_string(message);
    unsafe { console_log(level, h) };
    drop_ref(h);
}

/// Take ownership of a host-written span.
unsafe fn take_string(ret: [u32; 2]) -> Option<String> {
    let [ptr, len] = ret;
    if ptr == 0 {
        return None;
    }
    let bytes = std::slice::from_raw_parts(ptr as *const u8, len as usize);
    let text = String::from_utf8_lossy(bytes).into_owned();
    __hostlink_free(ptr as *mut u8, len as usize);
    Some(text)
}

fn describe(h: u32) -> String {
    let mut ret = [0u32; 2];
    unsafe {
        debug_string(&mut ret, h);
        take_string(ret).unwrap_or_default()
    }
}

fn property(obj: u32, name: &str) -> u32 {
    unsafe { get_property(obj, name.as_ptr(), name.len()) }
}

fn string_property(obj: u32, name: &str) -> Option<String> {
    let mut ret = [0u32; 2];
    unsafe {
        get_property_string(&mut ret, obj, name.as_ptr(), name.len());
        take_string(ret)
    }
}

fn method(obj: u32, name: &str, args: &[u32]) -> u32 {
    unsafe { call_method(obj, name.as_ptr(), name.len(), args.as_ptr(), args.len()) }
}

fn method_f64(obj: u32, name: &str, args: &[f64]) -> u32 {
    unsafe { call_method_f64(obj, name.as_ptr(), name.len(), args.as_ptr(), args.len()) }
}

// =============================================================================
// Closures
// =============================================================================
// The environment is a boxed trait object behind a thin pointer: `a` is that
// pointer and `b` is unused.

type Callback = Box<dyn FnMut(u32)>;

unsafe extern "C" fn trampoline(a: u32, _b: u32, arg: u32) {
    let callback = &mut *(a as *mut Callback);
    callback(arg);
}

unsafe extern "C" fn destroy(a: u32, _b: u32) {
    drop(Box::from_raw(a as *mut Callback));
}

/// A guest callback the host can hold on to.
pub struct Closure {
    handle: u32,
    env: u32,
}

impl Closure {
    /// Wrap `f`; the host receives a one-reference closure.
    pub fn new(f: impl FnMut(u32) + 'static) -> Self {
        let env = Box::into_raw(Box::new(Box::new(f) as Callback)) as u32;
        let handle = unsafe {
            closure_new(
                env,
                0,
                destroy as unsafe extern "C" fn(u32, u32) as usize as u32,
                trampoline as unsafe extern "C" fn(u32, u32, u32) as usize as u32,
            )
        };
        Self { handle, env }
    }

    /// Handle to pass to host capabilities.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Keep the closure alive for the rest of the instance.
    pub fn forget(self) -> u32 {
        let handle = self.handle;
        std::mem::forget(self);
        handle
    }
}

impl Drop for Closure {
    fn drop(&mut self) {
        // the host frees the environment itself if a call is in flight
        if unsafe { cb_drop(self.handle) } != 0 {
            unsafe { destroy(self.env, 0) };
        }
    }
}

// =============================================================================
// Entry points
// =============================================================================

/// Draw on the `screen` canvas, listen for keys and start a frame loop.
#[no_mangle]
pub extern "C" fn start() {
    log(LOG, "hostlink test guest starting");

    let window = unsafe { global("window".as_ptr(), 6) };
    let document = property(window, "document");

    let id = new_string("screen");
    let canvas = method(document, "getElementById", &[id]);
    drop_ref(id);

    if canvas == NULL {
        log(WARN, "no #screen canvas, skipping drawing");
    } else {
        unsafe {
            set_property_f64(canvas, "width".as_ptr(), 5, 640.0);
            set_property_f64(canvas, "height".as_ptr(), 6, 480.0);
        }
        let kind = new_string("2d");
        let ctx = method(canvas, "getContext", &[kind]);
        drop_ref(kind);

        unsafe { set_property_string(ctx, "fillStyle".as_ptr(), 9, "#336699".as_ptr(), 7) };
        drop_ref(method_f64(ctx, "fillRect", &[0.0, 0.0, 640.0, 480.0]));
        log(LOG, &format!("canvas context: {}", describe(ctx)));
        drop_ref(ctx);
        drop_ref(canvas);
    }

    let keydown = Closure::new(|event| {
        let key = string_property(event, "key").unwrap_or_default();
        log(LOG, &format!("key pressed: {}", key));
        drop_ref(event);
    });
    unsafe { add_event_listener(window, "keydown".as_ptr(), 7, keydown.handle()) };
    keydown.forget();

    let frame = Closure::new(|timestamp| {
        let n = FRAMES.with(|f| {
            f.set(f.get() + 1);
            f.get()
        });
        let mut ret = [0u32; 2];
        unsafe { debug_string(&mut ret, timestamp) };
        let at = unsafe { take_string(ret) }.unwrap_or_default();
        log(LOG, &format!("frame {} at {}ms", n, at));
        drop_ref(timestamp);
        let me = FRAME_CALLBACK.with(Cell::get);
        unsafe { request_animation_frame(me) };
    });
    unsafe { request_animation_frame(frame.handle()) };
    FRAME_CALLBACK.with(|f| f.set(frame.forget()));

    drop_ref(document);
    drop_ref(window);
}

/// Log a greeting for a host-provided name. Takes ownership of the span.
#[no_mangle]
pub unsafe extern "C" fn greet(ptr: *mut u8, len: usize) {
    let name = std::str::from_utf8(std::slice::from_raw_parts(ptr, len)).unwrap_or("?");
    log(LOG, &format!("hello, {}!", name));
    __hostlink_free(ptr, len);
}

/// Number of frames rendered so far.
#[no_mangle]
pub extern "C" fn frames() -> u32 {
    FRAMES.with(Cell::get)
}

/// Call a method the host does not have; the failure lands in the
/// exception store.
#[no_mangle]
pub extern "C" fn provoke_host_error() -> u32 {
    let window = unsafe { global("window".as_ptr(), 6) };
    let result = method(window, "definitelyNotAMethod", &[]);
    drop_ref(window);
    result
}

/// Abort the current call with a guest error.
#[no_mangle]
pub extern "C" fn fail() {
    let message = "guest gave up";
    unsafe { throw(message.as_ptr(), message.len()) };
}

/// Round-trip a number through the host and log it.
#[no_mangle]
pub extern "C" fn echo_number(n: f64) {
    let h = unsafe { number_new(n) };
    log(LOG, &format!("number: {}", describe(h)));
    drop_ref(h);
}
