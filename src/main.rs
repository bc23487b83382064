use std::env;
use std::fs;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use glam::Vec3;

use crystal_history::{Branch, SceneState, StateStack, MASTER_BRANCH};

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let options = CliOptions::parse()?;
    if options.demo {
        run_demo(&options.path)
    } else {
        run_inspect(&options.path)
    }
}

/// Runs a small scripted editing session and writes the resulting
/// state stack to disk.
fn run_demo(path: &str) -> Result<()> {
    let scene = SceneState::new();
    let mut stack = StateStack::new(Arc::new(scene.clone()));

    let root = scene.spawn_node("Root", None);
    let camera = scene.spawn_node("Camera", Some(root));
    scene.with_node_mut(camera, |node| node.position = Vec3::new(0.0, 2.0, 6.0));
    let prop = scene.spawn_node("Crate", Some(root));

    for id in [root, camera, prop] {
        stack.stage_insert(id);
    }
    stack.commit();
    println!(
        "Committed initial snapshot ({} nodes)",
        scene.node_count()
    );

    scene.with_node_mut(prop, |node| node.position = Vec3::new(4.0, 0.0, -2.0));
    stack.stage_update(prop);
    stack.commit();
    println!("Committed crate move (frame {})", frame_label(stack.current_branch()));

    let experiment = stack.create_branch();
    stack.switch_branch(experiment);
    let barrel = scene.spawn_node("Barrel", Some(root));
    stack.stage_insert(barrel);
    stack.commit();
    println!("Committed barrel on branch {experiment}");

    stack.switch_branch(MASTER_BRANCH);
    stack.apply_to_scene()?;
    println!("Switched back to master ({} nodes)", scene.node_count());

    stack.seek(-1);
    stack.apply_to_scene()?;
    println!("Undid crate move (cursor {})", frame_label(stack.current_branch()));

    scene.step(1.0 / 60.0);

    fs::write(path, stack.save()).with_context(|| format!("unable to write {path}"))?;
    println!("Saved state stack to {path}");

    print_final_state(&scene);
    Ok(())
}

/// Loads a state stack file and prints a summary of its branches.
fn run_inspect(path: &str) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("unable to open {path}"))?;
    let scene = SceneState::new();
    let stack = StateStack::load(Arc::new(scene), &bytes)
        .with_context(|| format!("failed to parse state stack {path}"))?;

    let master_frames = stack
        .branch(MASTER_BRANCH)
        .map_or(0, |branch| branch.frame_count());
    println!(
        "Loaded state stack with {} branches ({} frames on master)",
        stack.branch_count(),
        master_frames
    );
    for branch in stack.branches() {
        match branch.parent() {
            None => println!(
                " - branch {} (master): {} frames, cursor {}",
                branch.id(),
                branch.frame_count(),
                frame_label(branch)
            ),
            Some(link) => println!(
                " - branch {}: {} frames, cursor {}, forked from branch {} at frame {}",
                branch.id(),
                branch.frame_count(),
                frame_label(branch),
                link.branch,
                link.frame
                    .map_or_else(|| "none".to_string(), |frame| frame.to_string())
            ),
        }
    }
    Ok(())
}

fn frame_label(branch: &Branch) -> String {
    branch
        .cursor()
        .map_or_else(|| "none".to_string(), |cursor| cursor.to_string())
}

fn print_final_state(scene: &SceneState) {
    println!("Final scene nodes:");
    for id in scene.node_ids() {
        let Some(node) = scene.node(id) else {
            continue;
        };
        println!(
            " - {} pos=({:.2}, {:.2}, {:.2})",
            node.name, node.position.x, node.position.y, node.position.z
        );
    }
}

struct CliOptions {
    path: String,
    demo: bool,
}

impl CliOptions {
    fn parse() -> Result<Self> {
        let mut args = env::args().skip(1);
        let Some(path) = args.next() else {
            return Err(anyhow!("Usage: crystal-history <stack-file> [--demo]"));
        };
        let mut demo = false;
        for arg in args {
            match arg.as_str() {
                "--demo" => demo = true,
                other => {
                    return Err(anyhow!("Unknown argument: {other}. Expected --demo"));
                }
            }
        }
        Ok(Self { path, demo })
    }
}
