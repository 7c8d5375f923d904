//! Upstream response cache.
//!
//! Entries are dually indexed: a map keyed by a CRC-64 hash of the
//! canonical question string, and a min-heap ordered by expiration.
//! The cache is bounded by a byte budget; when the budget is exceeded
//! entries are evicted in expiration order whether or not they have
//! expired. TTLs in returned responses are decremented by the time the
//! entry has spent in the cache, so clients observe monotonically
//! decreasing TTLs across repeated hits.
//!
//! CRC-64 is a speed choice, not a security one. Collisions are
//! expected to be possible: a hit is confirmed against the full
//! question string and mismatches are counted, never trusted.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crc::{Crc, CRC_64_GO_ISO};
use hickory_proto::op::{Message, OpCode, Query, ResponseCode};

use crate::stats;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// Upper bound applied to an entry's lifetime on insertion.
const MAX_CACHE_TTL: u32 = 3600;

/// The canonical form of a question used for hashing and collision
/// verification.
pub fn canonical_question(query: &Query) -> String {
    format!(
        "{} {} {}",
        query.name().to_lowercase(),
        query.query_class(),
        query.query_type()
    )
}

pub fn question_key(question: &str) -> u64 {
    CRC64.checksum(question.as_bytes())
}

/// Whether an upstream response may be inserted at all.
pub fn cacheable(question: &Query, op_code: OpCode, response: &Message, budget: usize) -> bool {
    if budget == 0 {
        return false;
    }
    if response.response_code() != ResponseCode::NoError || response.truncated() {
        return false;
    }
    if op_code != OpCode::Query {
        return false;
    }
    if question.name().to_string().contains('*') {
        return false;
    }
    let mut queries = response.queries().iter();
    match (queries.next(), queries.next()) {
        (Some(echoed), None) => {
            echoed.query_type() == question.query_type()
                && echoed.query_class() == question.query_class()
                && echoed.name() == question.name()
        }
        _ => false,
    }
}

struct CacheEntry {
    question: String,
    response: Message,
    cached_at: Instant,
    eol: Instant,
    size: usize,
    /// Seconds already subtracted from this entry's TTLs by previous
    /// hits.
    time_eaten: u32,
}

/// The cache proper. Callers serialize access through a mutex.
pub struct ResponseCache {
    entries: HashMap<u64, CacheEntry>,
    eol_heap: BinaryHeap<Reverse<(Instant, u64)>>,
    size: usize,
    max_size: usize,
    lookups: u64,
    hits: u64,
}

impl ResponseCache {
    pub fn new(max_size: usize) -> Self {
        ResponseCache {
            entries: HashMap::new(),
            eol_heap: BinaryHeap::new(),
            size: 0,
            max_size,
            lookups: 0,
            hits: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Drop everything. Used when the upstream server changes: stale
    /// answers from the old upstream must not outlive it.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.eol_heap.clear();
        self.size = 0;
        self.publish_gauges();
    }

    pub fn insert(&mut self, question: &str, response: &Message) {
        self.insert_at(question, response, Instant::now());
    }

    pub fn lookup(&mut self, question: &str) -> Option<Message> {
        self.lookup_at(question, Instant::now())
    }

    /// Insert with an explicit clock, first-wins on key collision.
    pub fn insert_at(&mut self, question: &str, response: &Message, now: Instant) {
        self.expire(now);

        let min_ttl = match response.answers().iter().map(|record| record.ttl()).min() {
            Some(ttl) if ttl > 0 => ttl.min(MAX_CACHE_TTL),
            _ => return,
        };
        let encoded = match response.to_vec() {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("uncacheable response for {}: {}", question, err);
                return;
            }
        };

        let key = question_key(question);
        if self.entries.contains_key(&key) {
            metrics::counter!(stats::CACHE_COLLISIONS).increment(1);
            return;
        }

        let size = question.len() + encoded.len();
        let eol = now + Duration::from_secs(u64::from(min_ttl));
        self.entries.insert(
            key,
            CacheEntry {
                question: question.to_string(),
                response: response.clone(),
                cached_at: now,
                eol,
                size,
                time_eaten: 0,
            },
        );
        self.eol_heap.push(Reverse((eol, key)));
        self.size += size;
        self.expire(now);
        self.publish_gauges();
    }

    /// Look up with an explicit clock. A hit returns the cached
    /// response with all TTLs aged by the entry's residence time.
    pub fn lookup_at(&mut self, question: &str, now: Instant) -> Option<Message> {
        self.expire(now);
        self.lookups += 1;
        metrics::counter!(stats::CACHE_LOOKUPS).increment(1);

        let key = question_key(question);
        let mut collision = false;
        let response = match self.entries.get_mut(&key) {
            Some(entry) if entry.question == question => {
                let delta = now.saturating_duration_since(entry.cached_at).as_secs() as u32;
                let bite = delta.saturating_sub(entry.time_eaten);
                if bite > 0 {
                    bite_ttls(&mut entry.response, bite);
                    entry.time_eaten += bite;
                }
                Some(entry.response.clone())
            }
            Some(_) => {
                // 64-bit collision with a different question.
                collision = true;
                None
            }
            None => None,
        };

        if collision {
            metrics::counter!(stats::CACHE_COLLISIONS).increment(1);
        }
        if response.is_some() {
            self.hits += 1;
        }
        self.publish_hit_rate();
        response
    }

    /// Pop the expiration heap while the top entry has expired or the
    /// byte budget is exceeded.
    pub fn expire(&mut self, now: Instant) {
        while let Some(Reverse((eol, key))) = self.eol_heap.peek().copied() {
            if eol > now && self.size <= self.max_size {
                break;
            }
            self.eol_heap.pop();
            if let Some(entry) = self.entries.remove(&key) {
                self.size -= entry.size;
            }
        }
        self.publish_gauges();
    }

    fn publish_gauges(&self) {
        metrics::gauge!(stats::CACHE_SIZE).set(self.size as f64);
        metrics::gauge!(stats::CACHE_ENTRIES).set(self.entries.len() as f64);
    }

    fn publish_hit_rate(&self) {
        if self.lookups > 0 {
            metrics::gauge!(stats::CACHE_HIT_RATE)
                .set(100.0 * self.hits as f64 / self.lookups as f64);
        }
    }
}

/// Subtract `bite` seconds from every TTL in the message, clamped at
/// zero.
fn bite_ttls(message: &mut Message, bite: u32) {
    let aged = |mut record: hickory_proto::rr::Record| {
        let ttl = record.ttl().saturating_sub(bite);
        record.set_ttl(ttl);
        record
    };
    let answers: Vec<_> = message.take_answers().into_iter().map(aged).collect();
    message.insert_answers(answers);
    let name_servers: Vec<_> = message.take_name_servers().into_iter().map(aged).collect();
    message.insert_name_servers(name_servers);
    let additionals: Vec<_> = message.take_additionals().into_iter().map(aged).collect();
    message.insert_additionals(additionals);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;

    fn query_for(name: &str) -> Query {
        Query::query(Name::from_str(name).unwrap(), RecordType::A)
    }

    fn response_for(name: &str, ttl: u32) -> Message {
        let owner = Name::from_str(name).unwrap();
        let mut message = Message::new();
        message.set_message_type(hickory_proto::op::MessageType::Response);
        message.set_op_code(OpCode::Query);
        message.add_query(query_for(name));
        message.add_answer(Record::from_rdata(
            owner,
            ttl,
            RData::A(A::new(93, 184, 216, 34)),
        ));
        message
    }

    #[test]
    fn ttl_decrements_across_hits_and_expires() {
        let mut cache = ResponseCache::new(64 * 1024);
        let question = canonical_question(&query_for("host.example.com."));
        let t0 = Instant::now();

        cache.insert_at(&question, &response_for("host.example.com.", 120), t0);

        let at_30 = cache
            .lookup_at(&question, t0 + Duration::from_secs(30))
            .unwrap();
        assert_eq!(at_30.answers()[0].ttl(), 90);

        let at_100 = cache
            .lookup_at(&question, t0 + Duration::from_secs(100))
            .unwrap();
        assert_eq!(at_100.answers()[0].ttl(), 20);

        assert!(cache
            .lookup_at(&question, t0 + Duration::from_secs(130))
            .is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn size_is_sum_of_entry_sizes_and_budget_evicts() {
        // A budget that fits one entry but not two: eviction happens
        // in expiration order even though nothing has expired.
        let one = response_for("a.example.com.", 600);
        let entry_size =
            canonical_question(&query_for("a.example.com.")).len() + one.to_vec().unwrap().len();
        let mut cache = ResponseCache::new(entry_size + entry_size / 2);

        let t0 = Instant::now();
        let q_a = canonical_question(&query_for("a.example.com."));
        let q_b = canonical_question(&query_for("b.example.com."));
        cache.insert_at(&q_a, &one, t0);
        cache.insert_at(
            &q_b,
            &response_for("b.example.com.", 600),
            t0 + Duration::from_secs(1),
        );

        assert_eq!(cache.len(), 1);
        assert!(cache.size() <= entry_size + entry_size / 2);
        assert!(cache
            .lookup_at(&q_b, t0 + Duration::from_secs(2))
            .is_some());
        assert!(cache
            .lookup_at(&q_a, t0 + Duration::from_secs(2))
            .is_none());
    }

    #[test]
    fn first_insertion_wins() {
        let mut cache = ResponseCache::new(64 * 1024);
        let question = canonical_question(&query_for("host.example.com."));
        let t0 = Instant::now();

        cache.insert_at(&question, &response_for("host.example.com.", 120), t0);
        cache.insert_at(&question, &response_for("host.example.com.", 999), t0);

        let hit = cache.lookup_at(&question, t0).unwrap();
        assert_eq!(hit.answers()[0].ttl(), 120);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_ttl_and_empty_answers_are_not_cached() {
        let mut cache = ResponseCache::new(64 * 1024);
        let t0 = Instant::now();

        let question = canonical_question(&query_for("zero.example.com."));
        cache.insert_at(&question, &response_for("zero.example.com.", 0), t0);
        assert!(cache.is_empty());

        let mut empty = Message::new();
        empty.add_query(query_for("none.example.com."));
        cache.insert_at(
            &canonical_question(&query_for("none.example.com.")),
            &empty,
            t0,
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn ttl_clamped_at_one_hour() {
        let mut cache = ResponseCache::new(64 * 1024);
        let question = canonical_question(&query_for("long.example.com."));
        let t0 = Instant::now();

        cache.insert_at(&question, &response_for("long.example.com.", 86400), t0);
        assert!(cache
            .lookup_at(&question, t0 + Duration::from_secs(3599))
            .is_some());
        assert!(cache
            .lookup_at(&question, t0 + Duration::from_secs(3601))
            .is_none());
    }

    #[test]
    fn wildcard_and_wrong_question_are_uncacheable() {
        let response = response_for("host.example.com.", 120);
        assert!(cacheable(
            &query_for("host.example.com."),
            OpCode::Query,
            &response,
            1024
        ));
        assert!(!cacheable(
            &query_for("*.example.com."),
            OpCode::Query,
            &response_for("*.example.com.", 120),
            1024
        ));
        assert!(!cacheable(
            &query_for("other.example.com."),
            OpCode::Query,
            &response,
            1024
        ));
        assert!(!cacheable(
            &query_for("host.example.com."),
            OpCode::Query,
            &response,
            0
        ));
    }

    #[test]
    fn distinct_questions_get_distinct_keys() {
        let q_a = canonical_question(&query_for("a.example.com."));
        let q_b = canonical_question(&query_for("b.example.com."));
        assert_ne!(question_key(&q_a), question_key(&q_b));
        assert_eq!(question_key(&q_a), question_key(&q_a));
    }
}
