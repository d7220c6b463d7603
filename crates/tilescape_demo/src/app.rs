use anyhow::Result;
use tilescape_common::{App, Color, Key};

use crate::scene::{Scene, SceneKind};
use crate::{SCREEN_HEIGHT, SCREEN_SCALE, SCREEN_WIDTH};

/// Frontend wrapper around a demo scene.
///
/// Keys: `Q` quits, `F` flips the whole screen, `Space` pauses,
/// `Up`/`Down` change the scroll speed.
pub struct DemoApp {
    scene: Scene,
    paused: bool,
    should_exit: bool,
}

impl DemoApp {
    pub fn new(kind: SceneKind) -> Result<DemoApp> {
        Ok(DemoApp {
            scene: Scene::new(kind)?,
            paused: false,
            should_exit: false,
        })
    }
}

impl App for DemoApp {
    fn init(&mut self) {
        log::info!("demo init: {:?}", self.scene.kind());
    }

    fn update(&mut self, screen: &mut [u8]) {
        if !self.paused {
            self.scene.tick();
        }
        let frame = self.scene.composite();
        let mut i = 0;
        for y in 0..SCREEN_HEIGHT {
            for &pixel in frame.row(y) {
                let (r, g, b) = Color::from_rgb555(pixel).rgb();
                screen[i] = r;
                screen[i + 1] = g;
                screen[i + 2] = b;
                i += 3;
            }
        }
    }

    fn handle_key_event(&mut self, key: Key, is_down: bool) {
        if !is_down {
            return;
        }
        match key {
            Key::Q => self.should_exit = true,
            Key::F => self.scene.toggle_flip(),
            Key::Space => self.paused = !self.paused,
            Key::Up => self.scene.adjust_speed(1),
            Key::Down => self.scene.adjust_speed(-1),
            _ => {}
        }
    }

    fn should_exit(&self) -> bool {
        self.should_exit
    }

    fn exit(&mut self) {
        log::info!("demo exit");
    }

    fn width(&self) -> u32 {
        SCREEN_WIDTH as u32
    }

    fn height(&self) -> u32 {
        SCREEN_HEIGHT as u32
    }

    fn scale(&self) -> u32 {
        SCREEN_SCALE
    }

    fn title(&self) -> String {
        match self.scene.kind() {
            SceneKind::Playfield => "Tilescape Playfield".to_string(),
            SceneKind::Split => "Tilescape Split Layers".to_string(),
        }
    }
}
