use std::path::Path;
use std::sync::{Arc, Mutex};
use winit::application::ApplicationHandler;
use winit::dpi::{LogicalSize, PhysicalSize};
use winit::event::{ElementState, WindowEvent};
use winit::event_loop::{ActiveEventLoop, EventLoopProxy};
use winit::keyboard::{Key, ModifiersState, NamedKey};
use winit::window::{Window, WindowId};
use softbuffer::Surface;

use crate::coordinator::{Coordinator, DisplaySink};
use crate::error::SinkError;
use crate::files::{SortField, SortOrder};
use crate::loader::{CacheEntry, DecodedImage, Wake};
use crate::paths::CanonicalPath;
use crate::ui::render::{BG_COLOR, blit_scaled, fit_scale, rgb};

pub mod render;

// ---------------------------------------------------------------------------
// Worker wake-ups
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum UserEvent {
    /// A worker queued a message for the coordinator.
    Pipeline,
}

pub struct ProxyWaker(Mutex<EventLoopProxy<UserEvent>>);

impl ProxyWaker {
    pub fn new(proxy: EventLoopProxy<UserEvent>) -> Self {
        Self(Mutex::new(proxy))
    }
}

impl Wake for ProxyWaker {
    fn wake(&self) {
        if let Ok(proxy) = self.0.lock() {
            // Fails only once the event loop has exited.
            let _ = proxy.send_event(UserEvent::Pipeline);
        }
    }
}

// ---------------------------------------------------------------------------
// Display sink backed by the window
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct WindowSink {
    pub image: Option<Arc<DecodedImage>>,
    pub name: String,
    pub error: Option<String>,
    pub window: Option<Arc<Window>>,
}

impl WindowSink {
    fn request_redraw(&self) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl DisplaySink for WindowSink {
    fn show(&mut self, entry: &CacheEntry) -> Result<(), SinkError> {
        let img = entry.image().ok_or(SinkError::NothingToShow)?;
        if img.pixels.len() < img.stride * img.height as usize {
            return Err(SinkError::Rejected(format!(
                "{}x{} image with a {} byte pixel buffer",
                img.width,
                img.height,
                img.pixels.len()
            )));
        }
        self.image = Some(Arc::clone(img));
        self.name = entry.path.basename().to_owned();
        self.error = None;
        self.request_redraw();
        Ok(())
    }

    fn show_error(&mut self, path: &CanonicalPath, message: &str) {
        self.error = Some(format!("Could not load {}: {}", path.basename(), message));
        self.request_redraw();
    }
}

/// The clipboard image re-encoded as PNG so it goes through the regular decoder.
fn clipboard_png() -> Option<Vec<u8>> {
    let mut clipboard = match arboard::Clipboard::new() {
        Ok(c) => c,
        Err(e) => {
            log::debug!("[ui] clipboard unavailable: {}", e);
            return None;
        }
    };
    let data = match clipboard.get_image() {
        Ok(d) => d,
        Err(e) => {
            log::debug!("[ui] no image on clipboard: {}", e);
            return None;
        }
    };
    rgba_to_png(data.width as u32, data.height as u32, data.bytes.into_owned())
}

fn rgba_to_png(width: u32, height: u32, bytes: Vec<u8>) -> Option<Vec<u8>> {
    let rgba = image::RgbaImage::from_raw(width, height, bytes)?;
    let mut png = Vec::new();
    if let Err(e) = image::DynamicImage::ImageRgba8(rgba)
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
    {
        log::debug!("[ui] could not re-encode clipboard image: {}", e);
        return None;
    }
    Some(png)
}

// ---------------------------------------------------------------------------
// Application handler (winit 0.30 style)
// ---------------------------------------------------------------------------

pub struct App {
    pub coordinator: Coordinator<WindowSink>,
    pub window: Option<Arc<Window>>,
    pub context: Option<softbuffer::Context<Arc<Window>>>,
    pub surface: Option<Surface<Arc<Window>, Arc<Window>>>,
    modifiers: ModifiersState,
}

impl App {
    pub fn new(coordinator: Coordinator<WindowSink>) -> Self {
        Self {
            coordinator,
            window: None,
            context: None,
            surface: None,
            modifiers: ModifiersState::empty(),
        }
    }

    fn update_title(&self) {
        let Some(ref window) = self.window else { return };
        let sink = self.coordinator.sink();
        let nav = self.coordinator.nav();
        let stats = self.coordinator.cache_stats();

        let mut title = if sink.name.is_empty() {
            "iv".to_string()
        } else {
            sink.name.clone()
        };
        if let (Some(cursor), Some(folder)) = (nav.cursor, nav.folder.as_ref()) {
            let field = match folder.sort_field {
                SortField::Name => "name",
                SortField::Modified => "date",
            };
            let arrow = match folder.sort_order {
                SortOrder::Ascending => "asc",
                SortOrder::Descending => "desc",
            };
            title.push_str(&format!(" [{}/{}, by {} {}]", cursor + 1, folder.len(), field, arrow));
        }
        if let Some(views) = self.coordinator.current_entry().map(|e| e.view_count).filter(|&n| n > 1) {
            title.push_str(&format!(" (viewed {views}x)"));
        }
        if self.coordinator.is_loading() {
            title.push_str(" (loading)");
        }
        title.push_str(&format!(
            " | cache: {} images, {:.0}/{:.0} MB",
            stats.loaded,
            stats.bytes_in_use as f64 / (1024.0 * 1024.0),
            stats.budget as f64 / (1024.0 * 1024.0),
        ));
        if let Some(ref err) = sink.error {
            title = format!("{err} | {title}");
        }
        window.set_title(&title);
    }

    fn handle_key(&mut self, event_loop: &ActiveEventLoop, key: &Key) {
        match key {
            Key::Named(NamedKey::Escape) => self.quit(event_loop),
            Key::Named(NamedKey::ArrowRight) | Key::Named(NamedKey::Space) => {
                self.coordinator.move_cursor(1);
            }
            Key::Named(NamedKey::ArrowLeft) => {
                self.coordinator.move_cursor(-1);
            }
            Key::Named(NamedKey::Home) => {
                self.coordinator.first();
            }
            Key::Named(NamedKey::End) => {
                self.coordinator.last();
            }
            Key::Named(NamedKey::F5) => self.coordinator.rescan(),
            Key::Character(s) => match s.to_lowercase().as_str() {
                "v" if self.modifiers.control_key() => self.paste(),
                "q" => self.quit(event_loop),
                "l" => {
                    self.coordinator.move_cursor(1);
                }
                "h" => {
                    self.coordinator.move_cursor(-1);
                }
                "s" => {
                    let cfg = self.coordinator.config();
                    let field = match cfg.sort_field {
                        SortField::Name => SortField::Modified,
                        SortField::Modified => SortField::Name,
                    };
                    let order = cfg.sort_order;
                    self.coordinator.set_sort(field, order);
                }
                "o" => {
                    let cfg = self.coordinator.config();
                    let order = match cfg.sort_order {
                        SortOrder::Ascending => SortOrder::Descending,
                        SortOrder::Descending => SortOrder::Ascending,
                    };
                    let field = cfg.sort_field;
                    self.coordinator.set_sort(field, order);
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn paste(&mut self) {
        match clipboard_png() {
            Some(png) => self.coordinator.show_clipboard(png),
            None => self.coordinator.sink_mut().error = Some("Clipboard holds no image".into()),
        }
    }

    fn open(&mut self, path: &Path) {
        self.coordinator.open(path);
        self.update_title();
    }

    fn quit(&mut self, event_loop: &ActiveEventLoop) {
        self.coordinator.shutdown();
        event_loop.exit();
    }

    fn render(&self, frame: &mut [u32], fb_w: u32, fb_h: u32) {
        frame.fill(rgb(BG_COLOR[0], BG_COLOR[1], BG_COLOR[2]));

        let Some(ref img) = self.coordinator.sink().image else { return };
        let sw = fb_w as f32;
        let sh = fb_h as f32;
        let scale = fit_scale(img.width as f32, img.height as f32, sw, sh);
        let x0 = (sw - img.width as f32 * scale) / 2.0;
        let y0 = (sh - img.height as f32 * scale) / 2.0;
        blit_scaled(
            frame, fb_w, fb_h,
            &img.pixels, img.width, img.height, img.stride,
            x0, y0, scale,
        );
    }
}

impl ApplicationHandler<UserEvent> for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        let attrs = Window::default_attributes()
            .with_title("iv")
            .with_inner_size(LogicalSize::new(1280u32, 720u32));
        let window = Arc::new(event_loop.create_window(attrs).expect("create window"));
        let context = softbuffer::Context::new(Arc::clone(&window)).expect("create context");
        let surface = Surface::new(&context, Arc::clone(&window)).expect("create surface");

        window.request_redraw();
        self.coordinator.sink_mut().window = Some(Arc::clone(&window));
        self.window = Some(window);
        self.context = Some(context);
        self.surface = Some(surface);
        self.update_title();
    }

    fn user_event(&mut self, _event_loop: &ActiveEventLoop, event: UserEvent) {
        match event {
            UserEvent::Pipeline => {
                self.coordinator.process_pending();
                self.update_title();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => self.quit(event_loop),

            WindowEvent::Resized(PhysicalSize { width, height }) => {
                if let (Some(surface), Some(w), Some(h)) = (
                    self.surface.as_mut(),
                    std::num::NonZeroU32::new(width.max(1)),
                    std::num::NonZeroU32::new(height.max(1)),
                ) {
                    if let Err(e) = surface.resize(w, h) {
                        log::debug!("[ui] surface resize failed: {}", e);
                    }
                }
                if let Some(ref window) = self.window {
                    window.request_redraw();
                }
            }

            WindowEvent::ModifiersChanged(modifiers) => self.modifiers = modifiers.state(),

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state == ElementState::Pressed {
                    self.handle_key(event_loop, &event.logical_key);
                    self.update_title();
                }
            }

            WindowEvent::DroppedFile(path) => self.open(&path),

            WindowEvent::RedrawRequested => {
                let Some(ref window) = self.window else { return };
                let size = window.inner_size();
                let fb_w = size.width.max(1);
                let fb_h = size.height.max(1);
                // Take the surface out so rendering can borrow `self`.
                if let Some(mut surface) = self.surface.take() {
                    if let Ok(mut buffer) = surface.buffer_mut() {
                        self.render(&mut buffer, fb_w, fb_h);
                        if let Err(e) = buffer.present() {
                            log::debug!("[ui] present failed: {}", e);
                        }
                    }
                    self.surface = Some(surface);
                }
            }

            _ => {}
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.coordinator.shutdown();
    }
}
