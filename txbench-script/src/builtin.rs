//! Scripts shipped with the benchmark, selectable with `-b`.

use itertools::Itertools;

/// A builtin script: short name, description printed in reports, and script text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Builtin {
    pub name: &'static str,
    pub description: &'static str,
    pub script: &'static str,
}

pub const BUILTINS: &[Builtin] = &[
    Builtin {
        name: "tpcb-like",
        description: "<builtin: TPC-B (sort of)>",
        script: "\\set aid random(1, 100000 * :scale)\n\
                 \\set bid random(1, 1 * :scale)\n\
                 \\set tid random(1, 10 * :scale)\n\
                 \\set delta random(-5000, 5000)\n\
                 BEGIN;\n\
                 UPDATE pgbench_accounts SET abalance = abalance + :delta WHERE aid = :aid;\n\
                 SELECT abalance FROM pgbench_accounts WHERE aid = :aid;\n\
                 UPDATE pgbench_tellers SET tbalance = tbalance + :delta WHERE tid = :tid;\n\
                 UPDATE pgbench_branches SET bbalance = bbalance + :delta WHERE bid = :bid;\n\
                 INSERT INTO pgbench_history (tid, bid, aid, delta, mtime) \
                 VALUES (:tid, :bid, :aid, :delta, CURRENT_TIMESTAMP);\n\
                 END;\n",
    },
    Builtin {
        name: "simple-update",
        description: "<builtin: simple update>",
        script: "\\set aid random(1, 100000 * :scale)\n\
                 \\set bid random(1, 1 * :scale)\n\
                 \\set tid random(1, 10 * :scale)\n\
                 \\set delta random(-5000, 5000)\n\
                 BEGIN;\n\
                 UPDATE pgbench_accounts SET abalance = abalance + :delta WHERE aid = :aid;\n\
                 SELECT abalance FROM pgbench_accounts WHERE aid = :aid;\n\
                 INSERT INTO pgbench_history (tid, bid, aid, delta, mtime) \
                 VALUES (:tid, :bid, :aid, :delta, CURRENT_TIMESTAMP);\n\
                 END;\n",
    },
    Builtin {
        name: "select-only",
        description: "<builtin: select only>",
        script: "\\set aid random(1, 100000 * :scale)\n\
                 SELECT abalance FROM pgbench_accounts WHERE aid = :aid;\n",
    },
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuiltinError {
    #[error("no builtin script found for name \"{0}\"")]
    NotFound(String),
    #[error("ambiguous builtin name: {count} builtin scripts found for prefix \"{prefix}\"")]
    Ambiguous { prefix: String, count: usize },
}

/// Finds a builtin by exact name or unambiguous prefix.
pub fn find_builtin(name: &str) -> Result<&'static Builtin, BuiltinError> {
    if let Some(b) = BUILTINS.iter().find(|b| b.name == name) {
        return Ok(b);
    }
    let matches = BUILTINS
        .iter()
        .filter(|b| b.name.starts_with(name))
        .collect::<Vec<_>>();
    match matches.as_slice() {
        [b] => Ok(*b),
        [] => Err(BuiltinError::NotFound(name.to_owned())),
        many => Err(BuiltinError::Ambiguous {
            prefix: name.to_owned(),
            count: many.len(),
        }),
    }
}

/// The text printed for `-b list`.
pub fn listing() -> String {
    format!(
        "Available builtin scripts:\n{}\n",
        BUILTINS
            .iter()
            .map(|b| format!("\t{:>13}: {}", b.name, b.description))
            .join("\n")
    )
}
