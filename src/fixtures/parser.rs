/// Line-comment marker.
const COMMENT: &str = "--";
/// Statement terminator.
const TERMINATOR: char = ';';

/// Split fixture text into statements.
///
/// Lines are normalized to `\n`; blank lines and comment-only lines are
/// dropped; anything after `--` on a line is removed. The remaining lines are
/// joined with single spaces and cut at every `;`. Text after the last `;` is
/// returned as a final statement when non-empty.
///
/// The scan is purely textual: a `;` or `--` inside a string literal is
/// treated as syntax, so fixtures must not contain either inside literals.
pub fn parse_statements(text: &str) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut statements = Vec::new();
    let mut current = String::new();

    for line in normalized.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(COMMENT) {
            continue;
        }
        let code = match trimmed.find(COMMENT) {
            Some(at) => trimmed[..at].trim_end(),
            None => trimmed,
        };

        let mut pieces = code.split(TERMINATOR).peekable();
        while let Some(piece) = pieces.next() {
            push_piece(&mut current, piece);
            // Every piece but the last was followed by a terminator.
            if pieces.peek().is_some() {
                emit(&mut statements, &mut current);
            }
        }
    }
    emit(&mut statements, &mut current);

    statements
}

fn push_piece(current: &mut String, piece: &str) {
    let piece = piece.trim();
    if piece.is_empty() {
        return;
    }
    if !current.is_empty() {
        current.push(' ');
    }
    current.push_str(piece);
}

fn emit(statements: &mut Vec<String>, current: &mut String) {
    if !current.is_empty() {
        statements.push(std::mem::take(current));
    }
}
