use anyhow::{Context, Result};

use crate::database_ops::stadia::database::{StadiaDatabase, TableCounts};

#[derive(Debug, Clone, Default)]
pub struct DbCountsConfig {
    /// Database path; `STADIA_SQLITE` or the default when unset.
    pub sqlite: Option<String>,
}

pub fn run(cfg: DbCountsConfig) -> Result<()> {
    let db = match cfg.sqlite.as_deref() {
        Some(path) => StadiaDatabase::open(path),
        None => StadiaDatabase::from_env(),
    }
    .context("opening spider database")?;

    let counts = db.counts().context("counting records")?;
    print!("{}", render(&counts));
    Ok(())
}

fn render(counts: &[TableCounts]) -> String {
    let mut out = format!(
        "{:<20} {:>10} {:>10} {:>10}\n",
        "table", "records", "fetched", "pending"
    );
    for c in counts {
        out.push_str(&format!(
            "{:<20} {:>10} {:>10} {:>10}\n",
            c.table.as_str(),
            c.total,
            c.with_value,
            c.never_attempted
        ));
    }
    let total: u64 = counts.iter().map(|c| c.total).sum();
    let fetched: u64 = counts.iter().map(|c| c.with_value).sum();
    out.push_str(&format!("{:<20} {:>10} {:>10}\n", "total", total, fetched));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::stadia::TableName;

    #[test]
    fn render_lists_each_table_and_totals() {
        let counts = vec![
            TableCounts {
                table: TableName::Game,
                total: 5,
                with_value: 2,
                never_attempted: 3,
            },
            TableCounts {
                table: TableName::Sku,
                total: 6,
                with_value: 0,
                never_attempted: 6,
            },
        ];
        let out = render(&counts);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("Game"));
        assert!(lines[3].starts_with("total"));
        assert!(lines[3].contains("11"));
    }
}
