use crate::models::{Fact, Operation};
use chrono::{DateTime, Utc};

pub struct PackDef {
    pub name: &'static str,
    pub operation: Operation,
    pub min_operand: i64,
    pub max_operand: i64,
    /// Operands per group; group 1 holds the smallest facts.
    pub group_span: i64,
}

pub const PACKS: &[PackDef] = &[
    PackDef { name: "mul", operation: Operation::Mul, min_operand: 1, max_operand: 12, group_span: 3 },
    PackDef { name: "add", operation: Operation::Add, min_operand: 0, max_operand: 10, group_span: 4 },
];

pub fn find_pack(name: &str) -> Option<&'static PackDef> {
    PACKS.iter().find(|p| p.name == name)
}

impl PackDef {
    pub fn total_facts(&self) -> u32 {
        let span = (self.max_operand - self.min_operand + 1).max(0) as u32;
        span * span
    }

    pub fn fact_id(&self, left: i64, right: i64) -> String {
        format!("{}:{}:{}", self.operation.prefix(), left, right)
    }

    fn level_of(&self, left: i64, right: i64) -> u32 {
        let largest = left.max(right) - self.min_operand;
        (largest / self.group_span.max(1)) as u32 + 1
    }

    /// Every fact of the pack in introduction order: by group, then operands.
    pub fn facts_in_order(&self, now: DateTime<Utc>) -> Vec<Fact> {
        let mut facts = Vec::with_capacity(self.total_facts() as usize);
        for left in self.min_operand..=self.max_operand {
            for right in self.min_operand..=self.max_operand {
                let mut fact = Fact::new(
                    self.fact_id(left, right),
                    self.name,
                    vec![left, right],
                    self.operation.apply(left, right),
                    self.level_of(left, right),
                    now,
                );
                fact.difficulty = (left.min(right) - self.min_operand) as u32;
                facts.push(fact);
            }
        }
        facts.sort_by_key(|f| (f.level, f.operands[0].max(f.operands[1]), f.operands[0]));
        facts
    }

    pub fn fact_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.total_facts() as usize);
        for left in self.min_operand..=self.max_operand {
            for right in self.min_operand..=self.max_operand {
                ids.push(self.fact_id(left, right));
            }
        }
        ids
    }
}
