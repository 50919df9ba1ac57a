//! In-process host with a DOM-like object graph and a virtual clock.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ConsoleLevel, HostEnvironment, HostResult, ReadyCallback};
use crate::value::{HostFunction, HostValue, ObjectRef};

/// Methods the headless 2D context accepts and journals without further effect.
const CONTEXT_2D_METHODS: &[&str] = &[
    "arc",
    "beginPath",
    "bezierCurveTo",
    "clearRect",
    "clip",
    "closePath",
    "fill",
    "fillRect",
    "fillText",
    "lineTo",
    "moveTo",
    "quadraticCurveTo",
    "rect",
    "resetTransform",
    "restore",
    "rotate",
    "save",
    "scale",
    "setLineDash",
    "setTransform",
    "stroke",
    "strokeRect",
    "strokeText",
    "transform",
    "translate",
];

/// Viewport the headless window reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    /// `window.innerWidth`
    pub inner_width: f64,
    /// `window.innerHeight`
    pub inner_height: f64,
    /// `window.devicePixelRatio`
    pub device_pixel_ratio: f64,
    /// Initial `document.title`
    pub title: String,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            inner_width: 800.0,
            inner_height: 600.0,
            device_pixel_ratio: 1.0,
            title: String::new(),
        }
    }
}

/// One console write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsoleEntry {
    /// Severity
    pub level: ConsoleLevel,
    /// Arguments rendered and joined with spaces
    pub text: String,
}

/// One successful method call on a host object.
#[derive(Debug, Clone)]
pub struct MethodCall {
    /// Class of the receiver
    pub class: String,
    /// Method name
    pub method: String,
    /// Arguments as passed
    pub args: Vec<HostValue>,
}

#[derive(Debug)]
struct Timer {
    id: i32,
    due: f64,
    callback: HostValue,
}

#[derive(Debug)]
struct Listener {
    target: HostValue,
    event_type: String,
    callback: HostValue,
}

/// Host environment that runs entirely in process.
#[derive(Debug)]
pub struct HeadlessHost {
    window: HostValue,
    document: HostValue,
    elements: BTreeMap<String, HostValue>,
    contexts: Vec<(ObjectRef, HostValue)>,
    clock_ms: f64,
    next_id: i32,
    timers: Vec<Timer>,
    frames: Vec<(i32, HostValue)>,
    ready: Vec<ReadyCallback>,
    listeners: Vec<Listener>,
    console: Vec<ConsoleEntry>,
    calls: Vec<MethodCall>,
}

impl Default for HeadlessHost {
    fn default() -> Self {
        Self::new(ViewportConfig::default())
    }
}

impl HeadlessHost {
    /// Create a host with a window, a document and an empty body.
    pub fn new(viewport: ViewportConfig) -> Self {
        let body = Self::make_element("body");
        let document = HostValue::object_with(
            "Document",
            [("title", HostValue::String(viewport.title.clone())), ("body", body)],
        );
        let window = HostValue::object_with(
            "Window",
            [
                ("innerWidth", HostValue::Number(viewport.inner_width)),
                ("innerHeight", HostValue::Number(viewport.inner_height)),
                ("devicePixelRatio", HostValue::Number(viewport.device_pixel_ratio)),
                ("document", document.clone()),
                (
                    "location",
                    HostValue::object_with("Location", [("href", HostValue::string("about:blank"))]),
                ),
                ("performance", HostValue::object("Performance")),
            ],
        );

        Self {
            window,
            document,
            elements: BTreeMap::new(),
            contexts: Vec::new(),
            clock_ms: 0.0,
            next_id: 1,
            timers: Vec::new(),
            frames: Vec::new(),
            ready: Vec::new(),
            listeners: Vec::new(),
            console: Vec::new(),
            calls: Vec::new(),
        }
    }

    /// The global window object.
    pub fn window(&self) -> HostValue {
        self.window.clone()
    }

    /// The document object.
    pub fn document(&self) -> HostValue {
        self.document.clone()
    }

    /// Create an element and make it reachable through `getElementById`.
    pub fn add_element(&mut self, id: &str, tag: &str) -> HostValue {
        let element = Self::make_element(tag);
        if let Some(obj) = element.as_object() {
            obj.write().set("id", HostValue::string(id));
        }
        self.elements.insert(id.to_string(), element.clone());
        element
    }

    /// Build an event object of the given class.
    pub fn event<K: Into<String>>(class: &str, props: impl IntoIterator<Item = (K, HostValue)>) -> HostValue {
        let event = HostValue::object_with(class, props);
        if let Some(obj) = event.as_object() {
            obj.write().set("defaultPrevented", HostValue::Bool(false));
        }
        event
    }

    /// Advance the virtual clock, moving due timers and all pending frames
    /// to the ready queue. Returns how many callbacks became ready.
    pub fn advance(&mut self, ms: f64) -> usize {
        self.clock_ms += ms.max(0.0);
        let before = self.ready.len();

        let now = self.clock_ms;
        let (mut due, pending): (Vec<_>, Vec<_>) = self.timers.drain(..).partition(|t| t.due <= now);
        self.timers = pending;
        due.sort_by(|a, b| a.due.total_cmp(&b.due).then(a.id.cmp(&b.id)));
        self.ready.extend(due.into_iter().map(|t| ReadyCallback {
            callback: t.callback,
            arg: HostValue::Undefined,
        }));

        let stamp = HostValue::Number(now);
        self.ready.extend(self.frames.drain(..).map(|(_, callback)| ReadyCallback {
            callback,
            arg: stamp.clone(),
        }));

        self.ready.len() - before
    }

    /// Virtual time in milliseconds.
    pub fn clock(&self) -> f64 {
        self.clock_ms
    }

    /// Console writes so far.
    pub fn console_entries(&self) -> &[ConsoleEntry] {
        &self.console
    }

    /// Successful method calls so far.
    pub fn calls(&self) -> &[MethodCall] {
        &self.calls
    }

    /// Timers not yet due.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    /// Animation frames requested since the last [`HeadlessHost::advance`].
    pub fn pending_frames(&self) -> usize {
        self.frames.len()
    }

    /// Total registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn make_element(tag: &str) -> HostValue {
        let class = match tag {
            "canvas" => "HTMLCanvasElement",
            "div" => "HTMLDivElement",
            "body" => "HTMLBodyElement",
            _ => "HTMLElement",
        };
        let element = HostValue::object_with(
            class,
            [
                ("tagName", HostValue::string(tag.to_ascii_uppercase())),
                ("style", HostValue::object("CSSStyleDeclaration")),
                ("offsetWidth", HostValue::Number(0.0)),
                ("offsetHeight", HostValue::Number(0.0)),
            ],
        );
        if tag == "canvas" {
            if let Some(obj) = element.as_object() {
                let mut obj = obj.write();
                obj.set("width", HostValue::Number(300.0));
                obj.set("height", HostValue::Number(150.0));
            }
        }
        element
    }

    fn context_2d(&mut self, canvas: &ObjectRef) -> HostValue {
        if let Some((_, ctx)) = self.contexts.iter().find(|(c, _)| Arc::ptr_eq(c, canvas)) {
            return ctx.clone();
        }
        let ctx = HostValue::object_with(
            "CanvasRenderingContext2D",
            [
                ("canvas", HostValue::Object(canvas.clone())),
                ("fillStyle", HostValue::string("#000000")),
                ("strokeStyle", HostValue::string("#000000")),
                ("lineWidth", HostValue::Number(1.0)),
                ("lineCap", HostValue::string("butt")),
                ("lineJoin", HostValue::string("miter")),
                ("miterLimit", HostValue::Number(10.0)),
                ("lineDashOffset", HostValue::Number(0.0)),
                ("font", HostValue::string("10px sans-serif")),
            ],
        );
        self.contexts.push((canvas.clone(), ctx.clone()));
        ctx
    }

    fn next_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

fn arg_str<'a>(args: &'a [HostValue], index: usize, method: &str) -> HostResult<&'a str> {
    args.get(index)
        .and_then(HostValue::as_str)
        .ok_or_else(|| HostValue::type_error(format!("{}: argument {} must be a string", method, index)))
}

fn arg_num(args: &[HostValue], index: usize) -> f64 {
    args.get(index).and_then(HostValue::as_number).unwrap_or(f64::NAN)
}

fn require_function(callback: &HostValue, what: &str) -> HostResult<()> {
    if callback.is_function() {
        Ok(())
    } else {
        Err(HostValue::type_error(format!(
            "{}: callback is not a function ({})",
            what,
            callback.type_name()
        )))
    }
}

impl HostEnvironment for HeadlessHost {
    fn global(&mut self, name: &str) -> HostResult {
        match name {
            "window" | "self" | "globalThis" => Ok(self.window.clone()),
            "document" => Ok(self.document.clone()),
            _ => match self.window.property(name) {
                HostValue::Undefined => Err(HostValue::error(
                    "ReferenceError",
                    format!("{} is not defined", name),
                )),
                value => Ok(value),
            },
        }
    }

    fn get(&mut self, target: &HostValue, key: &str) -> HostResult {
        match target {
            HostValue::Undefined | HostValue::Null => Err(HostValue::type_error(format!(
                "Cannot read properties of {} (reading '{}')",
                target.type_name(),
                key
            ))),
            HostValue::String(s) if key == "length" => Ok(HostValue::Number(s.encode_utf16().count() as f64)),
            HostValue::Object(obj) => {
                let obj = obj.read();
                if obj.is_array() {
                    if key == "length" {
                        return Ok(HostValue::Number(obj.elements().len() as f64));
                    }
                    if let Ok(index) = key.parse::<usize>() {
                        return Ok(obj.elements().get(index).cloned().unwrap_or_default());
                    }
                }
                Ok(obj.get(key).cloned().unwrap_or_default())
            }
            HostValue::Function(f) if key == "name" => Ok(HostValue::string(f.name.clone())),
            _ => Ok(HostValue::Undefined),
        }
    }

    fn set(&mut self, target: &HostValue, key: &str, value: HostValue) -> HostResult<()> {
        match target {
            HostValue::Undefined | HostValue::Null => Err(HostValue::type_error(format!(
                "Cannot set properties of {} (setting '{}')",
                target.type_name(),
                key
            ))),
            HostValue::Object(obj) => {
                let mut obj = obj.write();
                if obj.is_array() {
                    if let Ok(index) = key.parse::<usize>() {
                        let elements = obj.elements_mut();
                        if index >= elements.len() {
                            elements.resize(index + 1, HostValue::Undefined);
                        }
                        elements[index] = value;
                        return Ok(());
                    }
                }
                obj.set(key, value);
                Ok(())
            }
            // writes to primitives are silently dropped
            _ => Ok(()),
        }
    }

    fn call_method(&mut self, target: &HostValue, method: &str, args: &[HostValue]) -> HostResult {
        let Some(obj) = target.as_object().cloned() else {
            return Err(HostValue::type_error(format!(
                "Cannot call {} on {}",
                method,
                target.type_name()
            )));
        };
        let class = obj.read().class().to_string();

        let result = match (class.as_str(), method) {
            ("Document", "getElementById") => {
                let id = arg_str(args, 0, method)?;
                self.elements.get(id).cloned().unwrap_or(HostValue::Null)
            }
            ("Document", "createElement") => Self::make_element(arg_str(args, 0, method)?),
            ("HTMLCanvasElement", "getContext") => match arg_str(args, 0, method)? {
                "2d" => self.context_2d(&obj),
                _ => HostValue::Null,
            },
            ("CanvasRenderingContext2D", "createLinearGradient" | "createRadialGradient") => {
                HostValue::object("CanvasGradient")
            }
            ("CanvasRenderingContext2D", "measureText") => {
                let text = arg_str(args, 0, method)?;
                HostValue::object_with(
                    "TextMetrics",
                    [("width", HostValue::Number(text.chars().count() as f64 * 8.0))],
                )
            }
            ("CanvasRenderingContext2D", "getTransform") => HostValue::object_with(
                "DOMMatrix",
                [
                    ("a", HostValue::Number(1.0)),
                    ("b", HostValue::Number(0.0)),
                    ("c", HostValue::Number(0.0)),
                    ("d", HostValue::Number(1.0)),
                    ("e", HostValue::Number(0.0)),
                    ("f", HostValue::Number(0.0)),
                ],
            ),
            ("CanvasRenderingContext2D", m) if CONTEXT_2D_METHODS.contains(&m) => HostValue::Undefined,
            ("CanvasGradient", "addColorStop") => {
                let offset = arg_num(args, 0);
                if !(0.0..=1.0).contains(&offset) {
                    return Err(HostValue::error(
                        "IndexSizeError",
                        format!("offset {} is outside the range [0, 1]", offset),
                    ));
                }
                arg_str(args, 1, method)?;
                HostValue::Undefined
            }
            ("CSSStyleDeclaration", "setProperty") => {
                let name = arg_str(args, 0, method)?.to_string();
                let value = arg_str(args, 1, method)?.to_string();
                obj.write().set(name, HostValue::String(value));
                HostValue::Undefined
            }
            ("CSSStyleDeclaration", "getPropertyValue") => {
                let name = arg_str(args, 0, method)?;
                match obj.read().get(name) {
                    Some(value) => value.clone(),
                    None => HostValue::string(""),
                }
            }
            ("Performance", "now") => HostValue::Number(self.clock_ms),
            ("Window", "clearTimeout") => {
                let id = arg_num(args, 0) as i32;
                self.timers.retain(|t| t.id != id);
                HostValue::Undefined
            }
            ("Window", "cancelAnimationFrame") => {
                let id = arg_num(args, 0) as i32;
                self.frames.retain(|(frame, _)| *frame != id);
                HostValue::Undefined
            }
            ("Array", "push") => {
                let mut obj = obj.write();
                obj.elements_mut().extend(args.iter().cloned());
                HostValue::Number(obj.elements().len() as f64)
            }
            (c, "preventDefault") if c.ends_with("Event") => {
                obj.write().set("defaultPrevented", HostValue::Bool(true));
                HostValue::Undefined
            }
            _ => {
                return Err(HostValue::type_error(format!(
                    "{}.{} is not a function",
                    class, method
                )))
            }
        };

        self.calls.push(MethodCall {
            class,
            method: method.to_string(),
            args: args.to_vec(),
        });
        Ok(result)
    }

    fn instance_of(&self, target: &HostValue, class: &str) -> bool {
        match target {
            HostValue::Object(obj) => {
                let obj = obj.read();
                let own = obj.class();
                own == class
                    || class == "Object"
                    || ((class == "Element" || class == "HTMLElement") && own.starts_with("HTML"))
                    || (class == "Event" && own.ends_with("Event"))
            }
            HostValue::Function(_) | HostValue::Closure(_) => class == "Function" || class == "Object",
            _ => false,
        }
    }

    fn console(&mut self, level: ConsoleLevel, args: &[HostValue]) {
        let text = args
            .iter()
            .map(HostValue::to_display_string)
            .collect::<Vec<_>>()
            .join(" ");
        match level {
            ConsoleLevel::Debug => tracing::debug!(target: "hostlink::console", "{}", text),
            ConsoleLevel::Log | ConsoleLevel::Info => tracing::info!(target: "hostlink::console", "{}", text),
            ConsoleLevel::Warn => tracing::warn!(target: "hostlink::console", "{}", text),
            ConsoleLevel::Error => tracing::error!(target: "hostlink::console", "{}", text),
        }
        self.console.push(ConsoleEntry { level, text });
    }

    fn set_timeout(&mut self, callback: HostValue, delay_ms: i32) -> HostResult<i32> {
        require_function(&callback, "setTimeout")?;
        let id = self.next_id();
        self.timers.push(Timer {
            id,
            due: self.clock_ms + delay_ms.max(0) as f64,
            callback,
        });
        Ok(id)
    }

    fn request_animation_frame(&mut self, callback: HostValue) -> HostResult<i32> {
        require_function(&callback, "requestAnimationFrame")?;
        let id = self.next_id();
        self.frames.push((id, callback));
        Ok(id)
    }

    fn add_event_listener(&mut self, target: &HostValue, event_type: &str, callback: HostValue) -> HostResult<()> {
        if target.as_object().is_none() {
            return Err(HostValue::type_error(format!(
                "addEventListener called on {}",
                target.type_name()
            )));
        }
        require_function(&callback, "addEventListener")?;
        let duplicate = self
            .listeners
            .iter()
            .any(|l| l.target == *target && l.event_type == event_type && l.callback == callback);
        if !duplicate {
            self.listeners.push(Listener {
                target: target.clone(),
                event_type: event_type.to_string(),
                callback,
            });
        }
        Ok(())
    }

    fn remove_event_listener(
        &mut self,
        target: &HostValue,
        event_type: &str,
        callback: &HostValue,
    ) -> HostResult<Option<HostValue>> {
        let position = self
            .listeners
            .iter()
            .position(|l| l.target == *target && l.event_type == event_type && l.callback == *callback);
        Ok(position.map(|i| self.listeners.remove(i).callback))
    }

    fn listeners(&self, target: &HostValue, event_type: &str) -> Vec<HostValue> {
        self.listeners
            .iter()
            .filter(|l| l.target == *target && l.event_type == event_type)
            .map(|l| l.callback.clone())
            .collect()
    }

    fn take_ready(&mut self) -> Vec<ReadyCallback> {
        std::mem::take(&mut self.ready)
    }

    fn now(&self) -> f64 {
        self.clock_ms
    }

    fn compile_function(&mut self, source: &str) -> HostResult {
        Ok(HostValue::Function(Arc::new(HostFunction {
            name: String::new(),
            source: source.to_string(),
        })))
    }

    fn call_function(&mut self, function: &HostValue, this: &HostValue) -> HostResult {
        match function {
            HostValue::Function(f) if f.source.trim().trim_end_matches(';') == "return this" => {
                if this.is_nullish() {
                    Ok(self.window.clone())
                } else {
                    Ok(this.clone())
                }
            }
            HostValue::Function(_) => Err(HostValue::type_error(
                "headless host cannot evaluate function bodies",
            )),
            other => Err(HostValue::type_error(format!(
                "{} is not a function",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::GuestClosure;

    fn callback() -> HostValue {
        HostValue::Closure(GuestClosure::wrap(1, 1, 0, 0))
    }

    #[test]
    fn test_window_reports_viewport() {
        let mut host = HeadlessHost::new(ViewportConfig {
            inner_width: 1024.0,
            device_pixel_ratio: 2.0,
            ..Default::default()
        });
        let window = host.global("window").unwrap();
        assert_eq!(host.get(&window, "innerWidth").unwrap(), HostValue::Number(1024.0));
        assert_eq!(host.get(&window, "devicePixelRatio").unwrap(), HostValue::Number(2.0));
        assert_eq!(host.global("self").unwrap(), window);
        assert!(host.instance_of(&window, "Window"));
    }

    #[test]
    fn test_unknown_global_is_reference_error() {
        let mut host = HeadlessHost::default();
        let err = host.global("global").unwrap_err();
        assert_eq!(err.property("name"), HostValue::string("ReferenceError"));
    }

    #[test]
    fn test_canvas_context_is_cached() {
        let mut host = HeadlessHost::default();
        host.add_element("screen", "canvas");
        let document = host.document();
        let canvas = host
            .call_method(&document, "getElementById", &[HostValue::string("screen")])
            .unwrap();
        assert!(host.instance_of(&canvas, "HTMLCanvasElement"));
        assert!(host.instance_of(&canvas, "Element"));

        let ctx1 = host.call_method(&canvas, "getContext", &[HostValue::string("2d")]).unwrap();
        let ctx2 = host.call_method(&canvas, "getContext", &[HostValue::string("2d")]).unwrap();
        assert_eq!(ctx1, ctx2);
        assert_eq!(
            host.call_method(&canvas, "getContext", &[HostValue::string("webgl")]).unwrap(),
            HostValue::Null
        );

        host.call_method(&ctx1, "fillText", &[HostValue::string("hi"), 1.0.into(), 2.0.into()])
            .unwrap();
        let last = host.calls().last().unwrap();
        assert_eq!(last.method, "fillText");
        assert_eq!(last.class, "CanvasRenderingContext2D");
    }

    #[test]
    fn test_missing_element_is_null() {
        let mut host = HeadlessHost::default();
        let document = host.document();
        let found = host
            .call_method(&document, "getElementById", &[HostValue::string("nope")])
            .unwrap();
        assert_eq!(found, HostValue::Null);
    }

    #[test]
    fn test_unknown_method_throws_type_error() {
        let mut host = HeadlessHost::default();
        let window = host.window();
        let err = host.call_method(&window, "noSuchMethod", &[]).unwrap_err();
        assert_eq!(err.property("name"), HostValue::string("TypeError"));
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_gradient_rejects_bad_offset() {
        let mut host = HeadlessHost::default();
        let gradient = HostValue::object("CanvasGradient");
        let err = host
            .call_method(&gradient, "addColorStop", &[2.0.into(), "red".into()])
            .unwrap_err();
        assert_eq!(err.property("name"), HostValue::string("IndexSizeError"));
        host.call_method(&gradient, "addColorStop", &[0.5.into(), "red".into()])
            .unwrap();
    }

    #[test]
    fn test_property_access_on_nullish_throws() {
        let mut host = HeadlessHost::default();
        assert!(host.get(&HostValue::Undefined, "x").is_err());
        assert!(host.set(&HostValue::Null, "x", HostValue::Null).is_err());
        assert_eq!(host.get(&HostValue::Number(1.0), "x").unwrap(), HostValue::Undefined);
    }

    #[test]
    fn test_array_access() {
        let mut host = HeadlessHost::default();
        let arr = HostValue::array(vec![]);
        host.set(&arr, "2", HostValue::string("c")).unwrap();
        assert_eq!(host.get(&arr, "length").unwrap(), HostValue::Number(3.0));
        assert_eq!(host.get(&arr, "2").unwrap(), HostValue::string("c"));
        assert_eq!(host.get(&arr, "0").unwrap(), HostValue::Undefined);
    }

    #[test]
    fn test_timers_fire_in_due_order() {
        let mut host = HeadlessHost::default();
        let late = callback();
        let early = callback();
        host.set_timeout(late.clone(), 50).unwrap();
        host.set_timeout(early.clone(), 10).unwrap();

        assert_eq!(host.advance(5.0), 0);
        assert_eq!(host.advance(50.0), 2);
        let ready = host.take_ready();
        assert_eq!(ready[0].callback, early);
        assert_eq!(ready[1].callback, late);
        assert!(host.take_ready().is_empty());
        assert_eq!(host.pending_timers(), 0);
    }

    #[test]
    fn test_clear_timeout() {
        let mut host = HeadlessHost::default();
        let id = host.set_timeout(callback(), 10).unwrap();
        let window = host.window();
        host.call_method(&window, "clearTimeout", &[HostValue::Number(id as f64)])
            .unwrap();
        assert_eq!(host.advance(100.0), 0);
    }

    #[test]
    fn test_animation_frame_receives_timestamp() {
        let mut host = HeadlessHost::default();
        host.request_animation_frame(callback()).unwrap();
        assert_eq!(host.pending_frames(), 1);
        host.advance(16.0);
        let ready = host.take_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].arg, HostValue::Number(16.0));
        assert_eq!(host.pending_frames(), 0);
    }

    #[test]
    fn test_non_function_callback_rejected() {
        let mut host = HeadlessHost::default();
        assert!(host.set_timeout(HostValue::Number(1.0), 0).is_err());
        assert!(host.request_animation_frame(HostValue::Null).is_err());
    }

    #[test]
    fn test_listeners_add_remove() {
        let mut host = HeadlessHost::default();
        let window = host.window();
        let cb = callback();
        host.add_event_listener(&window, "resize", cb.clone()).unwrap();
        host.add_event_listener(&window, "resize", cb.clone()).unwrap();
        assert_eq!(host.listener_count(), 1);
        assert_eq!(host.listeners(&window, "resize"), vec![cb.clone()]);
        assert!(host.listeners(&window, "click").is_empty());

        let removed = host.remove_event_listener(&window, "resize", &cb).unwrap();
        assert_eq!(removed, Some(cb.clone()));
        assert_eq!(host.remove_event_listener(&window, "resize", &cb).unwrap(), None);
    }

    #[test]
    fn test_prevent_default() {
        let mut host = HeadlessHost::default();
        let event = HeadlessHost::event("KeyboardEvent", [("key", HostValue::string("a"))]);
        host.call_method(&event, "preventDefault", &[]).unwrap();
        assert_eq!(event.property("defaultPrevented"), HostValue::Bool(true));
        assert!(host.instance_of(&event, "Event"));
    }

    #[test]
    fn test_function_return_this() {
        let mut host = HeadlessHost::default();
        let f = host.compile_function("return this").unwrap();
        let global = host.call_function(&f, &HostValue::Undefined).unwrap();
        assert_eq!(global, host.window());

        let other = host.compile_function("alert(1)").unwrap();
        assert!(host.call_function(&other, &HostValue::Undefined).is_err());
    }

    #[test]
    fn test_console_journal() {
        let mut host = HeadlessHost::default();
        host.console(
            ConsoleLevel::Warn,
            &[HostValue::string("fps"), HostValue::Number(60.0)],
        );
        assert_eq!(
            host.console_entries(),
            &[ConsoleEntry {
                level: ConsoleLevel::Warn,
                text: "fps 60".into()
            }]
        );
    }
}
