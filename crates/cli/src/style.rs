//! Terminal styling for command output.

use console::Style;

use idmigrate_core::models::Stage;

fn marked(symbol: &str, style: Style, msg: &str) -> String {
    format!("{} {}", style.apply_to(symbol), msg)
}

/// Green check mark, then `msg`.
pub fn success(msg: &str) -> String {
    marked("✓", Style::new().green(), msg)
}

/// Red cross, then `msg`.
pub fn error(msg: &str) -> String {
    marked("✗", Style::new().red(), msg)
}

/// Yellow warning sign, then `msg`.
pub fn warn(msg: &str) -> String {
    marked("⚠", Style::new().yellow(), msg)
}

/// Section heading.
pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Stage label colored by how far the user got.
pub fn stage(stage: Stage) -> String {
    let style = match stage {
        Stage::PasswordSet => Style::new().green(),
        Stage::ProfileCreated => Style::new().cyan(),
        Stage::Failed => Style::new().red().bold(),
        Stage::Pending => Style::new().dim(),
    };
    style.apply_to(stage.to_string()).to_string()
}
