use tilescape::Scene;

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let scene = args.next().unwrap_or_else(|| "playfield".to_string());

    let scene = match scene.as_str() {
        "playfield" | "scroll" => Scene::Playfield,
        "split" | "layers" => Scene::Split,
        other => {
            eprintln!("Unknown scene '{}'. Supported: playfield, split", other);
            std::process::exit(1);
        }
    };

    log::info!("starting scene: {scene:?}");
    if let Err(err) = tilescape::run(scene) {
        eprintln!("frontend error: {err:#}");
        std::process::exit(1);
    }
}
