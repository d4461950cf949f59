use deai::{Root, Value};

/// Default directory scanned for plugins at startup.
const PLUGIN_DIR: &str = "/usr/lib/deai";

fn setup(root: &Root, args: &[String]) -> Result<(), deai::Error> {
    root.set_argv(args.to_vec())?;

    match deai::load_plugin_from_dir(root, PLUGIN_DIR) {
        Ok(count) => log::debug!("loaded {} plugins from {}", count, PLUGIN_DIR),
        Err(err) => log::debug!("skipping plugin dir {}: {}", PLUGIN_DIR, err),
    }
    // The filesystem watch plugin ships with the daemon.
    if root.module("file").is_err() {
        deai::load_plugin(root, "file")?;
    }

    // `deai -- <script> [args...]` forwards the remainder to the scripting
    // module.
    if let Some(separator) = args.iter().position(|a| a == "--") {
        let rest = &args[separator + 1..];
        let Some(script) = rest.first() else {
            return Err(deai::Error::InvalidArgument(
                "no script given after --".to_string(),
            ));
        };
        let lua = root.module("lua")?;
        lua.call_method("load_script", vec![Value::String(script.clone())])?;
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("deai starting");
    let root = match Root::new() {
        Ok(root) => root,
        Err(err) => {
            log::error!("failed to initialize the root context: {}", err);
            std::process::exit(1);
        }
    };

    let args: Vec<String> = std::env::args().collect();
    if let Err(err) = setup(&root, &args) {
        log::error!("startup failed: {}", err);
        root.destroy();
        std::process::exit(1);
    }

    root.run();

    let exit_code = root.exit_code();
    root.destroy();
    log::info!("deai stopped");
    std::process::exit(exit_code);
}
