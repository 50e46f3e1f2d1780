//! Terminal stand-in for the sign in button, to-do list and text box.

use crate::error::ClientError;
use crate::session::{SessionController, View};
use anyhow::Result;
use dialoguer::{Input, Select};
use tokio::task;
use tracing::debug;

pub async fn main_menu(controller: &SessionController) -> Result<()> {
    report(controller.initialize().await);

    loop {
        let view = controller.snapshot().await;
        render(&view);

        let entries = menu_entries(&view);
        let selection =
            task::spawn_blocking(move || Select::new().items(&entries).default(0).interact())
                .await??;
        match selection {
            0 => report(controller.sign_in().await),
            1 => report(controller.list_items().await),
            2 => {
                let initial = view.input.clone();
                let text: String = task::spawn_blocking(move || {
                    Input::<String>::new()
                        .with_prompt("To Do item")
                        .with_initial_text(initial)
                        .allow_empty(true)
                        .interact_text()
                })
                .await??;
                controller.set_input(text).await;
                report(controller.submit_input().await);
            }
            3 => break,
            _ => {}
        }
    }
    Ok(())
}

/// Menu order matters: the first entry is the sign in button.
fn menu_entries(view: &View) -> Vec<String> {
    vec![
        view.state.label().to_string(),
        "Refresh list".to_string(),
        "Add item".to_string(),
        "Exit".to_string(),
    ]
}

fn render(view: &View) {
    println!();
    if view.items.is_empty() {
        println!("(no items)");
    }
    for item in &view.items {
        println!("  - {}", item.title);
    }
}

fn report(result: Result<(), ClientError>) {
    if let Err(err) = result {
        debug!(?err, "Action ended with an error");
        println!("{err}");
    }
}
