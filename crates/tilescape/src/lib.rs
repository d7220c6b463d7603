use anyhow::Result;
use tilescape_demo::{DemoApp, SceneKind, SCREEN_HEIGHT, SCREEN_SCALE, SCREEN_WIDTH};
use tilescape_sdl2::{SdlContext, SdlInitInfo};

pub use tilescape_demo::SceneKind as Scene;

pub fn run(scene: SceneKind) -> Result<()> {
    let app = DemoApp::new(scene)?;
    let init_info = SdlInitInfo::builder()
        .width(SCREEN_WIDTH as u32)
        .height(SCREEN_HEIGHT as u32)
        .scale(SCREEN_SCALE)
        .title(match scene {
            SceneKind::Playfield => "Tilescape Playfield".to_string(),
            SceneKind::Split => "Tilescape Split Layers".to_string(),
        })
        .build();
    SdlContext::run(init_info, app)?;
    Ok(())
}
