pub const WIDTH: usize = 80;

pub fn banner(title: &str, subtitle: &str) {
    println!("{}", "=".repeat(WIDTH));
    padding(title, " ", WIDTH);
    println!();
    println!("{}", "=".repeat(WIDTH));
    padding(subtitle, " ", WIDTH);
    println!();
    println!("{}", "=".repeat(WIDTH));
}

pub fn print_line(fields: Vec<String>) {
    println!("{}", "-".repeat(WIDTH));
    border();
    let mut consumed = 1;
    let last_id = fields.len().saturating_sub(1);
    for (i, field) in fields.into_iter().enumerate() {
        let added = if i == last_id {
            WIDTH.saturating_sub(consumed + 2)
        } else if i == 0 {
            20
        } else {
            field.len() + 2
        };
        padding(field.as_str(), " ", added);
        border();
        consumed += added + 2;
    }
    println!();
    println!("{}", "-".repeat(WIDTH));
}

fn border() {
    print!("|");
}

fn padding(value: &str, pad: &str, width: usize) {
    let r = width.saturating_sub(value.len());
    print!(" {}{}", value, pad.repeat(r));
}

// Stroops to whole KALE. Should not be too risky
pub fn normalize_amount(amount: i128) -> f64 {
    amount as f64 / 10000000f64
}
