use anyhow::{anyhow, Result};
use sdl2::event::Event;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::WindowCanvas;
use typed_builder::TypedBuilder;

pub use sdl2;
pub use tilescape_common::App;
use tilescape_common::Key;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    RGB24,
}

#[derive(TypedBuilder)]
pub struct SdlInitInfo {
    pub width: u32,
    pub height: u32,
    pub scale: u32,
    pub title: String,
    #[builder(default = PixelFormat::RGB24)]
    pub pixel_format: PixelFormat,
    /// Target frame duration; the loop sleeps the remainder of it.
    #[builder(default = std::time::Duration::from_micros(16_667))]
    pub frame_time: std::time::Duration,
}

pub struct SdlContext;

impl SdlContext {
    /// Open a window and run `app` until it asks to exit or the window
    /// closes. The app fills an RGB24 buffer each frame; we upload it to
    /// a streaming texture scaled up by `scale`.
    pub fn run(init: SdlInitInfo, mut app: impl App) -> Result<()> {
        let SdlInitInfo {
            width,
            height,
            scale,
            title,
            pixel_format,
            frame_time,
        } = init;
        let sdl_context = sdl2::init().map_err(|e| anyhow!(e))?;
        let video_subsystem = sdl_context.video().map_err(|e| anyhow!(e))?;
        let window = video_subsystem
            .window(&title, width * scale, height * scale)
            .position_centered()
            .build()?;
        let mut canvas: WindowCanvas = window.into_canvas().present_vsync().build()?;
        canvas
            .set_scale(scale as f32, scale as f32)
            .map_err(|e| anyhow!(e))?;
        let creator = canvas.texture_creator();
        let mut texture =
            creator.create_texture_streaming(map_pixel_format(pixel_format), width, height)?;

        let bytes_per_pixel = map_pixel_format_size(pixel_format);
        let mut screen_state = vec![0u8; (width * height * bytes_per_pixel) as usize];
        let mut event_pump = sdl_context.event_pump().map_err(|e| anyhow!(e))?;

        app.init();
        'running: loop {
            if app.should_exit() {
                break;
            }
            let frame_start = std::time::Instant::now();

            while let Some(event) = event_pump.poll_event() {
                match event {
                    Event::Quit { .. } => break 'running,
                    Event::KeyDown {
                        keycode: Some(keycode),
                        ..
                    } => app.handle_key_event(map_keycode(keycode), true),
                    Event::KeyUp {
                        keycode: Some(keycode),
                        ..
                    } => app.handle_key_event(map_keycode(keycode), false),
                    _ => {}
                }
            }

            app.update(&mut screen_state);

            texture.update(None, &screen_state, (width * bytes_per_pixel) as usize)?;
            canvas
                .copy(&texture, None, None)
                .map_err(|e| anyhow!(e))?;
            canvas.present();

            let elapsed = frame_start.elapsed();
            if elapsed < frame_time {
                std::thread::sleep(frame_time - elapsed);
            }
        }
        app.exit();
        log::info!("frontend shut down");

        Ok(())
    }
}

pub fn map_pixel_format(pixel_format: PixelFormat) -> PixelFormatEnum {
    match pixel_format {
        PixelFormat::RGB24 => PixelFormatEnum::RGB24,
    }
}

pub fn map_pixel_format_size(pixel_format: PixelFormat) -> u32 {
    match pixel_format {
        PixelFormat::RGB24 => 3,
    }
}

pub fn map_keycode(keycode: sdl2::keyboard::Keycode) -> Key {
    match keycode {
        sdl2::keyboard::Keycode::Num1 => Key::Num1,
        sdl2::keyboard::Keycode::Num2 => Key::Num2,
        sdl2::keyboard::Keycode::Num3 => Key::Num3,
        sdl2::keyboard::Keycode::Num4 => Key::Num4,
        sdl2::keyboard::Keycode::Q => Key::Q,
        sdl2::keyboard::Keycode::W => Key::W,
        sdl2::keyboard::Keycode::E => Key::E,
        sdl2::keyboard::Keycode::R => Key::R,
        sdl2::keyboard::Keycode::A => Key::A,
        sdl2::keyboard::Keycode::S => Key::S,
        sdl2::keyboard::Keycode::D => Key::D,
        sdl2::keyboard::Keycode::F => Key::F,
        sdl2::keyboard::Keycode::Z => Key::Z,
        sdl2::keyboard::Keycode::X => Key::X,
        sdl2::keyboard::Keycode::C => Key::C,
        sdl2::keyboard::Keycode::V => Key::V,
        sdl2::keyboard::Keycode::Up => Key::Up,
        sdl2::keyboard::Keycode::Down => Key::Down,
        sdl2::keyboard::Keycode::Left => Key::Left,
        sdl2::keyboard::Keycode::Right => Key::Right,
        sdl2::keyboard::Keycode::Space => Key::Space,
        _ => Key::None,
    }
}
