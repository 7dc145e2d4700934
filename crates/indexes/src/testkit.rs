//! Shared fixtures for the maintainer unit tests.

use taxis_core::{
    Index, IndexError, IndexKind, IndexMaintainer, KeyExpression, KvStore, Record,
    RecordAccess, Transaction, Tuple, TupleElement,
};
use taxis_memory::MemoryKv;

use crate::rank::RankMaintainer;

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub id: i64,
    pub name: String,
    pub score: i64,
    pub region: Option<String>,
}

impl Player {
    pub fn new(id: i64, score: i64) -> Self {
        Self {
            id,
            name: format!("player-{id}"),
            score,
            region: None,
        }
    }
}

impl Record for Player {
    fn record_type(&self) -> &'static str {
        "player"
    }

    fn primary_key(&self) -> Tuple {
        Tuple::new().with(self.id)
    }
}

pub struct PlayerAccess;

impl RecordAccess<Player> for PlayerAccess {
    fn extract_field(
        &self,
        record: &Player,
        name: &str,
    ) -> Result<Vec<TupleElement>, IndexError> {
        match name {
            "id" => Ok(vec![record.id.into()]),
            "name" => Ok(vec![record.name.as_str().into()]),
            "score" => Ok(vec![record.score.into()]),
            "region" => Ok(record
                .region
                .iter()
                .map(|r| TupleElement::from(r.as_str()))
                .collect()),
            other => Err(IndexError::invalid_argument(format!(
                "player has no field {other}"
            ))),
        }
    }

    fn deserialize(&self, _record_type: &str, _bytes: &[u8]) -> Result<Player, IndexError> {
        Err(IndexError::internal("fixture records are not serialized"))
    }
}

pub fn score_index() -> Index {
    Index::new(
        "by_score",
        IndexKind::Rank,
        KeyExpression::field("score"),
        vec!["player".into()],
    )
}

/// Insert one player per score and commit.
pub fn seed_scores(kv: &MemoryKv, rank: &RankMaintainer, scores: &[i64]) -> Vec<Player> {
    let players: Vec<_> = scores
        .iter()
        .enumerate()
        .map(|(i, score)| Player::new(i as i64 + 1, *score))
        .collect();

    let mut txn = kv.begin().unwrap();
    for player in &players {
        IndexMaintainer::<Player, _>::update_index(
            rank,
            None,
            Some(player),
            &PlayerAccess,
            &mut txn,
        )
        .unwrap();
    }
    txn.commit().unwrap();

    players
}
